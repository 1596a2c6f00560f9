use anyhow::Context;
use lms_realtime::logging::{self, DEFAULT_FILTER};
use lms_realtime::session::bind_channel;
use lms_realtime::{
    log_info, log_warn, ApiClient, AuthState, ChannelEvent, EventKind, Handler, RealtimeChannel,
    RealtimeConfig, SessionStore, Storage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(DEFAULT_FILTER);

    let config = RealtimeConfig::from_env();
    let storage = Storage::open_default().context("no config directory on this platform")?;
    log_info!("Session storage at {}", storage.dir().display());

    let api = ApiClient::new().with_base_url(config.api_url.clone());
    let auth = AuthState::restore(SessionStore::new(storage), &api).await;
    let Some(session) = auth.current() else {
        anyhow::bail!("no stored session; log in to the LMS first");
    };

    let channel = RealtimeChannel::with_websocket(config);
    if channel.connect_session(&session).is_none() {
        anyhow::bail!("could not start the realtime connection");
    }
    let binding = bind_channel(channel.clone(), auth.subscribe());

    channel.on(EventKind::Connect, Handler::new(|_| log_info!("Listening for notifications")));
    channel.on(
        EventKind::ReconnectFailed,
        Handler::new(|_| log_warn!("Realtime server unreachable; giving up")),
    );
    channel.on(EventKind::NewNotification, Handler::new(print_event));
    channel.on(EventKind::Announcement, Handler::new(print_event));
    channel.on(EventKind::NewMessage, Handler::new(print_event));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    log_info!("Shutting down");
    drop(auth);
    binding.await.context("session binding task failed")?;
    Ok(())
}

fn print_event(event: &ChannelEvent) {
    match event {
        ChannelEvent::Notification(n) => {
            let at = n.created_at.with_timezone(&chrono::Local);
            println!("[{}] {}: {}", at.format("%H:%M"), n.title, n.message)
        }
        ChannelEvent::Announcement(a) => println!("[announcement] {}: {}", a.title, a.content),
        ChannelEvent::Message(m) => {
            println!("[{}] {}: {}", m.conversation_id, m.sender_id, m.content)
        }
        other => log_info!("{:?}", other),
    }
}
