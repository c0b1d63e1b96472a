#![forbid(unsafe_code)]

// In-process chat hub implementing Transport, for driving sessions without a server

use crate::config::{ClientIdentity, RoomId};
use crate::protocol::{ChatPayload, ChatUser, ClientMessage, InboundEvent};
use crate::transport::{Connection, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Fault injection knobs
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Tokens refused at connect time
    pub rejected_tokens: HashSet<String>,
    /// username -> k: the k-th chat send of that user closes its connection
    pub close_on_send: HashMap<String, usize>,
    /// username -> k: the k-th chat send of that user fails with a non-close error
    pub io_error_on_send: HashMap<String, usize>,
    /// Users whose own broadcasts are never delivered back to them
    pub silent_users: HashSet<String>,
    /// Unrelated events delivered to the sender ahead of each echo
    pub noise_per_echo: usize,
    /// Per-user delay before a connect completes
    pub connect_delay: HashMap<String, Duration>,
}

#[derive(Debug, Clone)]
pub struct SendRecord {
    pub username: String,
    pub message: ClientMessage,
    pub at: Instant,
}

struct Member {
    connection_id: usize,
    username: String,
    inbox: mpsc::UnboundedSender<InboundEvent>,
}

#[derive(Default)]
pub struct MockHub {
    behavior: MockBehavior,
    rooms: Mutex<HashMap<RoomId, Vec<Member>>>,
    sends: Mutex<Vec<SendRecord>>,
    next_id: AtomicUsize,
    open: AtomicUsize,
}

impl MockHub {
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_by(&self, username: &str) -> Vec<ClientMessage> {
        self.sends()
            .into_iter()
            .filter(|s| s.username == username)
            .map(|s| s.message)
            .collect()
    }

    pub fn chat_sends(&self) -> Vec<SendRecord> {
        self.sends()
            .into_iter()
            .filter(|s| matches!(s.message, ClientMessage::Message { .. }))
            .collect()
    }

    fn record(&self, username: &str, message: &ClientMessage) {
        self.sends.lock().unwrap().push(SendRecord {
            username: username.to_string(),
            message: message.clone(),
            at: Instant::now(),
        });
    }

    fn join(&self, room_id: &RoomId, connection_id: usize, username: &str, inbox: &mpsc::UnboundedSender<InboundEvent>) {
        let mut rooms = self.rooms.lock().unwrap();
        let members = rooms.entry(room_id.clone()).or_default();
        if members.iter().all(|m| m.connection_id != connection_id) {
            members.push(Member {
                connection_id,
                username: username.to_string(),
                inbox: inbox.clone(),
            });
        }
    }

    fn leave(&self, room_id: &RoomId, connection_id: usize) {
        if let Some(members) = self.rooms.lock().unwrap().get_mut(room_id) {
            members.retain(|m| m.connection_id != connection_id);
        }
    }

    fn disconnect(&self, connection_id: usize) {
        for members in self.rooms.lock().unwrap().values_mut() {
            members.retain(|m| m.connection_id != connection_id);
        }
    }

    fn broadcast(&self, room_id: &RoomId, sender_id: usize, sender: &str, payload: ChatPayload) {
        let event = InboundEvent::chat(&payload);
        let rooms = self.rooms.lock().unwrap();
        let Some(members) = rooms.get(room_id) else {
            return;
        };
        for member in members {
            if member.connection_id == sender_id {
                for n in 0..self.behavior.noise_per_echo {
                    let _ = member.inbox.send(noise(n, &member.username));
                }
                if self.behavior.silent_users.contains(sender) {
                    continue;
                }
            }
            let _ = member.inbox.send(event.clone());
        }
    }
}

/// Alternates unrelated chat broadcasts and non-chat events
fn noise(n: usize, username: &str) -> InboundEvent {
    if n % 2 == 0 {
        InboundEvent::chat(&ChatPayload {
            content: format!("chatter {n} for {username}"),
            user: Some(ChatUser {
                id: None,
                username: "bystander".into(),
            }),
            ..Default::default()
        })
    } else {
        InboundEvent {
            kind: "user_joined".into(),
            data: serde_json::json!({ "username": "bystander" }),
        }
    }
}

#[derive(Clone)]
pub struct MockTransport {
    hub: Arc<MockHub>,
}

impl MockTransport {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            hub: Arc::new(MockHub {
                behavior,
                ..Default::default()
            }),
        }
    }

    pub fn hub(&self) -> &MockHub {
        &self.hub
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(&self, identity: &ClientIdentity) -> Result<MockConnection, TransportError> {
        if let Some(delay) = self.hub.behavior.connect_delay.get(&identity.username) {
            tokio::time::sleep(*delay).await;
        }
        if self.hub.behavior.rejected_tokens.contains(&identity.token) {
            return Err(TransportError::Connect("HTTP error: 401 Unauthorized".into()));
        }

        let (inbox, rx) = mpsc::unbounded_channel();
        self.hub.open.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.hub.next_id.fetch_add(1, Ordering::SeqCst),
            username: identity.username.clone(),
            hub: self.hub.clone(),
            inbox,
            rx,
            chats_sent: 0,
            closed: false,
        })
    }
}

pub struct MockConnection {
    id: usize,
    username: String,
    hub: Arc<MockHub>,
    inbox: mpsc::UnboundedSender<InboundEvent>,
    rx: mpsc::UnboundedReceiver<InboundEvent>,
    chats_sent: usize,
    closed: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::closed());
        }
        self.hub.record(&self.username, message);

        match message {
            ClientMessage::Join { room_id } => {
                self.hub.join(room_id, self.id, &self.username, &self.inbox)
            }
            ClientMessage::Leave { room_id } => self.hub.leave(room_id, self.id),
            ClientMessage::Message {
                room_id,
                content,
                client_id,
            } => {
                self.chats_sent += 1;
                if self.hub.behavior.io_error_on_send.get(&self.username) == Some(&self.chats_sent) {
                    return Err(TransportError::Io("broken frame".into()));
                }
                if self.hub.behavior.close_on_send.get(&self.username) == Some(&self.chats_sent) {
                    self.closed = true;
                    self.hub.disconnect(self.id);
                    return Ok(());
                }
                let payload = ChatPayload {
                    content: content.clone(),
                    user: Some(ChatUser {
                        id: None,
                        username: self.username.clone(),
                    }),
                    client_generated_id: client_id.clone(),
                    ..Default::default()
                };
                self.hub.broadcast(room_id, self.id, &self.username, payload);
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<InboundEvent, TransportError> {
        if self.closed {
            return Err(TransportError::Closed {
                reason: Some("1001 going away".into()),
            });
        }
        // Our own sender keeps the channel open; a silent wait is ended by the caller's timeout.
        self.rx.recv().await.ok_or_else(TransportError::closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.hub.disconnect(self.id);
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
        self.hub.open.fetch_sub(1, Ordering::SeqCst);
    }
}
