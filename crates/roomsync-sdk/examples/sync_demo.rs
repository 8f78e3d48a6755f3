//! 房间同步演示
//!
//! 用法：
//!   ROOMSYNC_HOMESERVER=https://matrix.example.org \
//!   ROOMSYNC_USER=alice ROOMSYNC_PASSWORD=secret \
//!   cargo run --example sync_demo
//!
//! 也可以用 `ROOMSYNC_TOKEN` 代替用户名密码。设置 `ROOMSYNC_DATA_DIR` 时使用 sled 持久化缓存。

use std::path::PathBuf;
use std::sync::Arc;

use roomsync_sdk::{
    ClientEvent, ClientOptions, LoginRequest, RoomSyncClient, SledCacheFactory,
};
use tokio::time::{timeout, Duration};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("========================================");
    println!("RoomSync 同步演示");
    println!("========================================\n");

    let homeserver = std::env::var("ROOMSYNC_HOMESERVER")
        .unwrap_or_else(|_| "http://localhost:8008".to_string());

    let mut builder = ClientOptions::builder(homeserver.clone()).timeline_limit(20);
    if let Ok(dir) = std::env::var("ROOMSYNC_DATA_DIR") {
        let factory = SledCacheFactory::open(&PathBuf::from(dir))?;
        println!("💾 缓存目录: {}", factory.path().display());
        builder = builder.cache(Arc::new(factory));
    }
    let client = RoomSyncClient::new(builder.build())?;
    println!("✅ 客户端已创建: {}\n", homeserver);

    let request = match std::env::var("ROOMSYNC_TOKEN") {
        Ok(token) => LoginRequest::token(token),
        Err(_) => LoginRequest::password(
            std::env::var("ROOMSYNC_USER").unwrap_or_else(|_| "demo".to_string()),
            std::env::var("ROOMSYNC_PASSWORD").unwrap_or_default(),
        ),
    };

    client.add_listener("error", |event| {
        if let ClientEvent::Error(e) = event {
            eprintln!("❌ [{}] {}", e.kind(), e);
        }
    });

    let mut events = client.subscribe();
    println!("🔐 正在登录...");
    client.login(request).await?;
    println!("✅ 登录成功，同步已启动\n");

    // 观察一分钟的同步事件
    let deadline = Duration::from_secs(60);
    let _ = timeout(deadline, async {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::Ready => {
                    println!("🎉 初始同步完成，共 {} 个房间", client.rooms().len());
                    for handle in client.rooms().handles() {
                        let room = handle.read();
                        println!(
                            "   {} {} ({:?}, {} 个已加入成员)",
                            room.room_id(),
                            room.display_name(),
                            room.membership(),
                            room.joined_members().len()
                        );
                    }
                }
                ClientEvent::Sync(delta) => {
                    println!(
                        "🔄 增量 {}: {} 个房间更新",
                        delta.next_cursor,
                        delta.rooms.len()
                    );
                }
                ClientEvent::Error(e) if e.is_fatal() => {
                    println!("⚠️ 凭证失效，停止演示");
                    break;
                }
                ClientEvent::Error(_) => {}
            }
        }
    })
    .await;

    if let Some(stats) = client.sync_stats() {
        println!(
            "\n📊 同步统计: rounds={}, successes={}, failures={}",
            stats.rounds, stats.successes, stats.failures
        );
    }

    client.logout().await?;
    println!("👋 已登出");
    Ok(())
}
