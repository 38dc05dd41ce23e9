//! Participants and orders of one session, folded from pushed events.

use std::sync::Arc;

use tableside_shared::{ApiError, Order, Participant, Session, SessionEvent, SessionState};
use tokio::sync::watch;

use crate::api_client::ApiClient;
use crate::ws::{SessionHandle, Subscription};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterState {
    pub session: Option<Session>,
    /// In order of arrival.
    pub participants: Vec<Participant>,
    /// In order first seen; updates replace in place.
    pub orders: Vec<Order>,
    /// Bumped on every pushed event.
    pushes: u64,
}

impl RosterState {
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn order(&self, id: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == id)
    }

    /// Orders placed by one participant.
    pub fn orders_for(&self, participant_id: &str) -> Vec<&Order> {
        self.orders
            .iter()
            .filter(|o| o.participant.as_deref() == Some(participant_id))
            .collect()
    }

    fn replace(&mut self, state: SessionState) {
        self.session = Some(state.session);
        self.participants = Vec::new();
        for participant in state.participants {
            upsert_participant(&mut self.participants, participant);
        }
        self.orders = Vec::new();
        for order in state.orders {
            upsert_order(&mut self.orders, order);
        }
    }

    /// Fold one event in. Returns `false` when it changed nothing.
    fn apply(&mut self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::SessionState(state) => {
                self.replace(state.clone());
                true
            }
            SessionEvent::SessionUpdate(patch) => match self.session.as_mut() {
                Some(session) => {
                    patch.apply_to(session);
                    true
                }
                None => false,
            },
            SessionEvent::ParticipantJoined(participant) => {
                if self.participant(&participant.id).is_some() {
                    return false;
                }
                self.participants.push(participant.clone());
                true
            }
            SessionEvent::ParticipantApproved(participant) => {
                upsert_participant(&mut self.participants, participant.clone());
                true
            }
            SessionEvent::ParticipantLeft(participant) => {
                let before = self.participants.len();
                self.participants.retain(|p| p.id != participant.id);
                self.participants.len() != before
            }
            SessionEvent::OrderCreated(order) | SessionEvent::OrderUpdated(order) => {
                upsert_order(&mut self.orders, order.clone());
                true
            }
            _ => false,
        }
    }
}

fn upsert_participant(participants: &mut Vec<Participant>, participant: Participant) {
    match participants.iter_mut().find(|p| p.id == participant.id) {
        Some(existing) => *existing = participant,
        None => participants.push(participant),
    }
}

fn upsert_order(orders: &mut Vec<Order>, order: Order) {
    match orders.iter_mut().find(|o| o.id == order.id) {
        Some(existing) => *existing = order,
        None => orders.push(order),
    }
}

/// Consolidated participant and order lists for one session.
pub struct SessionRoster {
    session_id: String,
    api: ApiClient,
    state: Arc<watch::Sender<RosterState>>,
    _subscription: Subscription,
    _handle: SessionHandle,
}

impl SessionRoster {
    pub fn attach(handle: SessionHandle, api: ApiClient) -> Self {
        let (state, _) = watch::channel(RosterState::default());
        let state = Arc::new(state);

        let sink = state.clone();
        let subscription = handle.on_any(move |event| {
            sink.send_if_modified(|roster| {
                let changed = roster.apply(event);
                if changed {
                    roster.pushes += 1;
                }
                changed
            });
        });

        Self {
            session_id: handle.session_id().to_string(),
            api,
            state,
            _subscription: subscription,
            _handle: handle,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> RosterState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RosterState> {
        self.state.subscribe()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.state.borrow().participants.clone()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.state.borrow().orders.clone()
    }

    /// Fetch the full session and use it as the baseline, unless a pushed
    /// event arrived while the request was in flight.
    pub async fn load_baseline(&self) -> Result<SessionState, ApiError> {
        let started_at = self.state.borrow().pushes;
        let fetched = self.api.get_session(&self.session_id).await.map_err(|e| {
            crate::log_warn!(session = self.session_id, "session fetch failed: {}", e);
            e
        })?;

        let applied = self.state.send_if_modified(|roster| {
            if roster.pushes != started_at {
                return false;
            }
            roster.replace(fetched.clone());
            true
        });
        if !applied {
            crate::log_debug!(
                session = self.session_id,
                "discarding fetched session, a newer push arrived"
            );
        }
        Ok(fetched)
    }
}
