//! Shared cart store for one session.
//!
//! The authoritative cart is whatever the server last pushed (`cart_state` or
//! `cart_update`, both whole-state). Mutations go out as REST requests and
//! never touch the local copy; their effect shows up with the next push.

use std::sync::Arc;

use tableside_shared::{
    AddCartItem, ApiError, CartItem, CartSnapshot, EventKind, Money, SessionEvent, UpdateCartItem,
};
use tokio::sync::watch;

use crate::api_client::ApiClient;
use crate::ws::{ConnectionEvent, SessionHandle, Subscription};

/// Observable cart state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CartState {
    pub items: Vec<CartItem>,
    /// Total as reported by the server alongside the items.
    pub reported_total: Money,
    pub reported_count: u32,
    /// An authoritative snapshot has been applied since the last disconnect.
    pub synced: bool,
    /// A snapshot fetch is in flight.
    pub loading: bool,
    /// Message from the last failed request, until the next one succeeds.
    pub error: Option<String>,
    /// Bumped on every pushed snapshot.
    pushes: u64,
}

/// One participant's lines in the shared cart.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantItems {
    pub participant_id: String,
    pub participant_name: String,
    pub items: Vec<CartItem>,
}

impl ParticipantItems {
    pub fn subtotal(&self) -> Money {
        self.items.iter().map(CartItem::line_total).sum()
    }
}

impl CartState {
    /// Sum of the current line totals.
    pub fn total(&self) -> Money {
        self.items.iter().map(CartItem::line_total).sum()
    }

    /// Sum of quantities.
    pub fn items_count(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items grouped by owning participant, in order of each participant's
    /// first line.
    pub fn items_by_participant(&self) -> Vec<ParticipantItems> {
        let mut groups: Vec<ParticipantItems> = Vec::new();
        for item in &self.items {
            match groups
                .iter_mut()
                .find(|group| group.participant_id == item.participant)
            {
                Some(group) => group.items.push(item.clone()),
                None => groups.push(ParticipantItems {
                    participant_id: item.participant.clone(),
                    participant_name: item.participant_name.clone(),
                    items: vec![item.clone()],
                }),
            }
        }
        groups
    }

    /// Lines owned by `participant_id`.
    pub fn my_items(&self, participant_id: &str) -> Vec<CartItem> {
        self.items
            .iter()
            .filter(|item| item.participant == participant_id)
            .cloned()
            .collect()
    }

    fn apply(&mut self, snapshot: CartSnapshot) {
        self.items = snapshot.items;
        self.reported_total = snapshot.total;
        self.reported_count = snapshot.items_count;
        self.synced = true;
        self.loading = false;
    }
}

fn apply_push(state: &watch::Sender<CartState>, session_id: &str, snapshot: &CartSnapshot) {
    state.send_modify(|cart| {
        cart.apply(snapshot.clone());
        cart.pushes += 1;
        let computed = cart.total();
        if computed != cart.reported_total {
            crate::log_warn!(
                session = session_id,
                "cart total mismatch: server says {}, lines add up to {}",
                cart.reported_total,
                computed
            );
        }
    });
}

/// Reconciles the shared cart of one session.
pub struct SharedCart {
    session_id: String,
    participant_id: Option<String>,
    api: ApiClient,
    state: Arc<watch::Sender<CartState>>,
    _subscriptions: Vec<Subscription>,
    _handle: SessionHandle,
}

impl SharedCart {
    /// Start tracking the cart pushed over `handle`.
    ///
    /// `participant_id` identifies the local participant for [`my_items`](Self::my_items).
    pub fn attach(handle: SessionHandle, api: ApiClient, participant_id: Option<String>) -> Self {
        let session_id = handle.session_id().to_string();
        let (state, _) = watch::channel(CartState::default());
        let state = Arc::new(state);

        let mut subscriptions = Vec::with_capacity(3);
        for kind in [EventKind::CartState, EventKind::CartUpdate] {
            let state = state.clone();
            let session = session_id.clone();
            subscriptions.push(handle.on(kind, move |event| match event {
                SessionEvent::CartState(snapshot) | SessionEvent::CartUpdate(snapshot) => {
                    apply_push(&state, &session, snapshot)
                }
                _ => {}
            }));
        }

        let on_drop = state.clone();
        subscriptions.push(handle.on_disconnect(move |_: &ConnectionEvent| {
            on_drop.send_if_modified(|cart| std::mem::replace(&mut cart.synced, false));
        }));

        Self {
            session_id,
            participant_id,
            api,
            state,
            _subscriptions: subscriptions,
            _handle: handle,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> CartState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CartState> {
        self.state.subscribe()
    }

    /// Lines owned by the local participant (empty when anonymous).
    pub fn my_items(&self) -> Vec<CartItem> {
        match &self.participant_id {
            Some(id) => self.state.borrow().my_items(id),
            None => Vec::new(),
        }
    }

    pub fn items_by_participant(&self) -> Vec<ParticipantItems> {
        self.state.borrow().items_by_participant()
    }

    /// Point-in-time read of the whole cart, applied as the baseline.
    ///
    /// If a pushed snapshot arrives while the request is in flight, the push
    /// wins and the fetched copy is discarded.
    pub async fn fetch_snapshot(&self) -> Result<CartSnapshot, ApiError> {
        let mut started_at = 0;
        self.state.send_modify(|cart| {
            cart.loading = true;
            started_at = cart.pushes;
        });

        let result = self.api.get_cart(&self.session_id).await;
        match &result {
            Ok(snapshot) => {
                if !self.apply_fetched(snapshot.clone(), started_at) {
                    crate::log_debug!(
                        session = self.session_id,
                        "discarding fetched cart, a newer push arrived"
                    );
                }
            }
            Err(e) => {
                crate::log_warn!(session = self.session_id, "cart fetch failed: {}", e);
                self.state.send_modify(|cart| {
                    cart.loading = false;
                    cart.error = Some(e.user_message());
                });
            }
        }
        result
    }

    fn apply_fetched(&self, snapshot: CartSnapshot, started_at: u64) -> bool {
        let mut applied = false;
        self.state.send_modify(|cart| {
            cart.loading = false;
            if cart.pushes == started_at {
                cart.apply(snapshot);
                cart.error = None;
                applied = true;
            }
        });
        applied
    }

    pub async fn add_item(&self, item: AddCartItem) -> Result<CartItem, ApiError> {
        let result = self.api.add_cart_item(&self.session_id, &item).await;
        self.record("add item", result)
    }

    pub async fn update_item(
        &self,
        item_id: &str,
        update: UpdateCartItem,
    ) -> Result<CartItem, ApiError> {
        let result = self
            .api
            .update_cart_item(&self.session_id, item_id, &update)
            .await;
        self.record("update item", result)
    }

    pub async fn remove_item(&self, item_id: &str) -> Result<(), ApiError> {
        let result = self.api.remove_cart_item(&self.session_id, item_id).await;
        self.record("remove item", result)
    }

    /// Remove every line the local participant owns.
    pub async fn clear_own_items(&self) -> Result<(), ApiError> {
        let result = self.api.clear_own_cart_items(&self.session_id).await;
        self.record("clear own items", result)
    }

    pub fn clear_error(&self) {
        self.state
            .send_if_modified(|cart| cart.error.take().is_some());
    }

    fn record<T>(&self, action: &str, result: Result<T, ApiError>) -> Result<T, ApiError> {
        match &result {
            Ok(_) => self.clear_error(),
            Err(e) => {
                crate::log_warn!(session = self.session_id, "{} failed: {}", action, e);
                let message = e.user_message();
                self.state.send_modify(|cart| cart.error = Some(message));
            }
        }
        result
    }
}
