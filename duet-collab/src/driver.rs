//! Runs a [`Session`] on its own tokio task.
//!
//! Transport events, timer ticks and commands from any number of
//! [`SessionHandle`]s are funnelled through channels into one loop, so the
//! session is only ever touched from that task.
//!
//! ```text
//! SessionHandle ──Command──┐
//! SessionHandle ──Command──┤
//!                          ├──► select! ──► Session ──► Transport
//! transport ──Event────────┤
//! interval ──tick──────────┘
//! ```

use duet_core::{Attributes, Edit};
use std::collections::BTreeMap;
use std::ops::Range;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::awareness::{CursorRange, Presence};
use crate::session::{Session, SessionError, SessionEvent, SessionState};
use crate::transport::{Transport, TransportEvent};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Insert {
        index: usize,
        text: String,
        attributes: Attributes,
        reply: Reply<Result<Edit, SessionError>>,
    },
    Delete {
        range: Range<usize>,
        reply: Reply<Result<Edit, SessionError>>,
    },
    Format {
        range: Range<usize>,
        attributes: Attributes,
        reply: Reply<Result<Edit, SessionError>>,
    },
    SetPresence {
        presence: Option<Presence>,
        reply: Reply<Result<(), SessionError>>,
    },
    SetCursor {
        cursor: Option<CursorRange>,
        reply: Reply<Result<(), SessionError>>,
    },
    Text(Reply<String>),
    Presence(Reply<BTreeMap<Uuid, Presence>>),
    State(Reply<SessionState>),
    Subscribe(Reply<mpsc::UnboundedReceiver<SessionEvent>>),
    Close(Reply<()>),
}

/// Cloneable handle to a session running under [`spawn_session`].
#[derive(Clone)]
pub struct SessionHandle {
    peer: Uuid,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn peer_id(&self) -> Uuid {
        self.peer
    }

    async fn request<R>(&self, make: impl FnOnce(Reply<R>) -> Command) -> Option<R> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn insert(
        &self,
        index: usize,
        text: impl Into<String>,
        attributes: Attributes,
    ) -> Result<Edit, SessionError> {
        let text = text.into();
        self.request(|reply| Command::Insert { index, text, attributes, reply })
            .await
            .unwrap_or(Err(SessionError::Closed))
    }

    pub async fn delete(&self, range: Range<usize>) -> Result<Edit, SessionError> {
        self.request(|reply| Command::Delete { range, reply })
            .await
            .unwrap_or(Err(SessionError::Closed))
    }

    pub async fn format(&self, range: Range<usize>, attributes: Attributes) -> Result<Edit, SessionError> {
        self.request(|reply| Command::Format { range, attributes, reply })
            .await
            .unwrap_or(Err(SessionError::Closed))
    }

    pub async fn set_presence(&self, presence: Option<Presence>) -> Result<(), SessionError> {
        self.request(|reply| Command::SetPresence { presence, reply })
            .await
            .unwrap_or(Err(SessionError::Closed))
    }

    pub async fn set_cursor(&self, cursor: Option<CursorRange>) -> Result<(), SessionError> {
        self.request(|reply| Command::SetCursor { cursor, reply })
            .await
            .unwrap_or(Err(SessionError::Closed))
    }

    pub async fn text(&self) -> Result<String, SessionError> {
        self.request(Command::Text).await.ok_or(SessionError::Closed)
    }

    pub async fn presence(&self) -> Result<BTreeMap<Uuid, Presence>, SessionError> {
        self.request(Command::Presence).await.ok_or(SessionError::Closed)
    }

    /// `Closed` once the session task has stopped.
    pub async fn state(&self) -> SessionState {
        self.request(Command::State)
            .await
            .unwrap_or(SessionState::Closed)
    }

    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>, SessionError> {
        self.request(Command::Subscribe).await.ok_or(SessionError::Closed)
    }

    /// Close the session and stop its task. Idempotent.
    pub async fn close(&self) {
        let _ = self.request(Command::Close).await;
    }
}

/// Connect `session` and drive it until it is closed or every handle is
/// dropped. Must be called from within a tokio runtime.
pub fn spawn_session<T>(
    mut session: Session<T>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    tick_interval: Duration,
) -> SessionHandle
where
    T: Transport + 'static,
{
    let (tx, mut commands) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        peer: session.peer_id(),
        commands: tx,
    };

    tokio::spawn(async move {
        if let Err(e) = session.connect() {
            log::warn!("Session {} not started: {e}", session.peer_id());
            return;
        }
        log::info!("Session {} running in room {}", session.peer_id(), session.room());

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut transport_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Close(reply)) => {
                            session.close();
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => run_command(&mut session, command),
                        None => {
                            session.close();
                            break;
                        }
                    }
                }
                event = events.recv(), if transport_open => {
                    match event {
                        Some(event) => session.handle_transport_event(event),
                        None => {
                            log::debug!("Transport event stream ended");
                            transport_open = false;
                            session.handle_transport_event(TransportEvent::Disconnected);
                        }
                    }
                }
                _ = ticker.tick() => session.tick(Instant::now()),
            }
        }
        log::info!("Session {} stopped", session.peer_id());
    });

    handle
}

fn run_command<T: Transport>(session: &mut Session<T>, command: Command) {
    match command {
        Command::Insert { index, text, attributes, reply } => {
            let _ = reply.send(session.insert(index, &text, attributes));
        }
        Command::Delete { range, reply } => {
            let _ = reply.send(session.delete(range));
        }
        Command::Format { range, attributes, reply } => {
            let _ = reply.send(session.format(range, attributes));
        }
        Command::SetPresence { presence, reply } => {
            let _ = reply.send(session.set_presence(presence));
        }
        Command::SetCursor { cursor, reply } => {
            let _ = reply.send(session.set_cursor(cursor));
        }
        Command::Text(reply) => {
            let _ = reply.send(session.text());
        }
        Command::Presence(reply) => {
            let _ = reply.send(session.presence());
        }
        Command::State(reply) => {
            let _ = reply.send(session.state());
        }
        Command::Subscribe(reply) => {
            let _ = reply.send(session.subscribe());
        }
        Command::Close(reply) => {
            session.close();
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::transport::LocalHub;
    use tokio::time::timeout;

    fn start(hub: &LocalHub, room: &str) -> SessionHandle {
        let config = SessionConfig::new(room);
        let (transport, events) = hub.join(room, config.peer);
        spawn_session(Session::new(config, transport), events, Duration::from_millis(50))
    }

    async fn wait_until_converged(a: &SessionHandle, b: &SessionHandle, len: usize) {
        timeout(Duration::from_secs(2), async {
            loop {
                let (ta, tb) = (a.text().await.unwrap(), b.text().await.unwrap());
                let live = a.state().await == SessionState::Live && b.state().await == SessionState::Live;
                if live && ta == tb && ta.chars().count() == len {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sessions did not converge");
    }

    #[tokio::test]
    async fn test_two_handles_converge() {
        let hub = LocalHub::new();
        let a = start(&hub, "room");
        let b = start(&hub, "room");

        a.insert(0, "hello", Attributes::new()).await.unwrap();
        b.insert(0, "well, ", Attributes::new()).await.unwrap();

        wait_until_converged(&a, &b, 11).await;
    }

    #[tokio::test]
    async fn test_handle_clones_share_session() {
        let hub = LocalHub::new();
        let a = start(&hub, "room");
        let a2 = a.clone();
        a.insert(0, "ab", Attributes::new()).await.unwrap();
        a2.insert(2, "c", Attributes::new()).await.unwrap();
        assert_eq!(a.text().await.unwrap(), "abc");
        assert_eq!(a.peer_id(), a2.peer_id());
    }

    #[tokio::test]
    async fn test_close_stops_task() {
        let hub = LocalHub::new();
        let a = start(&hub, "room");
        let mut events = a.subscribe().await.unwrap();

        a.close().await;
        a.close().await;
        assert_eq!(a.state().await, SessionState::Closed);
        assert_eq!(a.insert(0, "x", Attributes::new()).await, Err(SessionError::Closed));

        // The event stream ends once the session is gone.
        let drained = timeout(Duration::from_secs(1), async {
            while events.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
        assert_eq!(hub.peer_count("room"), 0);
    }
}
