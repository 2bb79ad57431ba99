//! Sessions driven on their own tasks, talking through an in-process hub.

use duet_collab::{
    spawn_session, CursorRange, LocalHub, Presence, Session, SessionConfig, SessionEvent,
    SessionHandle, SessionState,
};
use duet_core::{attributes, Attributes, RelativePosition};
use std::time::Duration;
use tokio::time::timeout;

fn start(hub: &LocalHub, room: &str) -> SessionHandle {
    let config = SessionConfig::new(room);
    let (transport, events) = hub.join(room, config.peer);
    spawn_session(Session::new(config, transport), events, Duration::from_millis(20))
}

/// Wait until every handle is live and holds `expected`.
async fn converge(handles: &[&SessionHandle], expected: &str) {
    let result = timeout(Duration::from_secs(3), async {
        loop {
            let mut done = true;
            for handle in handles {
                let live = handle.state().await == SessionState::Live;
                let text = handle.text().await.unwrap_or_default();
                done &= live && text == expected;
            }
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if result.is_err() {
        for handle in handles {
            eprintln!("{}: {:?}", handle.peer_id(), handle.text().await);
        }
        panic!("sessions did not reach {expected:?}");
    }
}

/// Wait until all handles agree on some text of `len` characters.
async fn agree(handles: &[&SessionHandle], len: usize) -> String {
    timeout(Duration::from_secs(3), async {
        loop {
            let first = handles[0].text().await.unwrap_or_default();
            let mut same = first.chars().count() == len;
            for handle in &handles[1..] {
                same &= handle.text().await.unwrap_or_default() == first;
            }
            if same {
                return first;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sessions did not agree")
}

#[tokio::test]
async fn test_three_peers_concurrent_typing() {
    let hub = LocalHub::new();
    let a = start(&hub, "doc");
    let b = start(&hub, "doc");
    let c = start(&hub, "doc");

    let (ra, rb, rc) = tokio::join!(
        a.insert(0, "aaa", Attributes::new()),
        b.insert(0, "bbb", Attributes::new()),
        c.insert(0, "ccc", Attributes::new()),
    );
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let text = agree(&[&a, &b, &c], 9).await;
    for run in ["aaa", "bbb", "ccc"] {
        assert!(text.contains(run), "{run} interleaved in {text:?}");
    }
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let hub = LocalHub::new();
    let a = start(&hub, "doc");
    a.insert(0, "hello world", Attributes::new()).await.unwrap();
    a.format(0..5, attributes([("bold", true)])).await.unwrap();
    a.delete(5..11).await.unwrap();

    let b = start(&hub, "doc");
    converge(&[&a, &b], "hello").await;

    b.insert(5, "!", Attributes::new()).await.unwrap();
    converge(&[&a, &b], "hello!").await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let hub = LocalHub::new();
    let a = start(&hub, "one");
    let b = start(&hub, "two");

    a.insert(0, "first", Attributes::new()).await.unwrap();
    b.insert(0, "second", Attributes::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(a.text().await.unwrap(), "first");
    assert_eq!(b.text().await.unwrap(), "second");
    assert_eq!(hub.room_count(), 2);
}

#[tokio::test]
async fn test_presence_reaches_peers_and_clears_on_close() {
    let hub = LocalHub::new();
    let a = start(&hub, "doc");
    let b = start(&hub, "doc");
    a.insert(0, "abc", Attributes::new()).await.unwrap();
    converge(&[&a, &b], "abc").await;

    a.set_presence(Some(Presence::new("Ada", "#ff0000"))).await.unwrap();

    let a_id = a.peer_id();
    let seen = timeout(Duration::from_secs(2), async {
        loop {
            let presence = b.presence().await.unwrap();
            if let Some(p) = presence.get(&a_id) {
                break p.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("presence not received");
    assert_eq!(seen.name, "Ada");
    assert_eq!(seen.color, "#ff0000");

    a.close().await;
    timeout(Duration::from_secs(2), async {
        while b.presence().await.unwrap().contains_key(&a_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("presence not cleared");
}

#[tokio::test]
async fn test_cursor_is_shared() {
    let hub = LocalHub::new();
    let a = start(&hub, "doc");
    let b = start(&hub, "doc");
    a.insert(0, "world", Attributes::new()).await.unwrap();
    converge(&[&a, &b], "world").await;

    a.set_presence(Some(Presence::new("Ada", "#00ff00"))).await.unwrap();
    a.set_cursor(Some(CursorRange::caret(RelativePosition::End)))
        .await
        .unwrap();

    let a_id = a.peer_id();
    let cursor = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(cursor) = b.presence().await.unwrap().get(&a_id).and_then(|p| p.cursor) {
                break cursor;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cursor not received");
    assert_eq!(cursor, CursorRange::caret(RelativePosition::End));
}

#[tokio::test]
async fn test_disconnect_and_reconnect_recovers_offline_edits() {
    let hub = LocalHub::new();
    let a = start(&hub, "doc");
    let b = start(&hub, "doc");
    let mut events = b.subscribe().await.unwrap();

    a.insert(0, "base", Attributes::new()).await.unwrap();
    converge(&[&a, &b], "base").await;

    hub.disconnect("doc", b.peer_id());
    timeout(Duration::from_secs(2), async {
        while b.state().await != SessionState::Connecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("b never noticed the disconnect");

    // Both sides keep editing while apart.
    a.insert(4, " online", Attributes::new()).await.unwrap();
    b.insert(0, "offline ", Attributes::new()).await.unwrap();
    assert_eq!(b.text().await.unwrap(), "offline base");

    hub.reconnect("doc", b.peer_id());
    converge(&[&a, &b], "offline base online").await;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert!(states.contains(&SessionState::Connecting));
    assert_eq!(states.last(), Some(&SessionState::Live));
}
