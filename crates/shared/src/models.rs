//! Shared data models for table sessions, their participants, carts and orders.

use std::fmt;
use std::iter::Sum;
use std::ops::Add;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// --- Identifiers ---

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

/// Accept an identifier sent either as a JSON string or a JSON integer.
pub fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

/// Nullable variant of [`id_from_string_or_number`].
pub fn opt_id_from_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}

// --- Money ---

/// A currency amount in minor units (cents).
///
/// The backend serializes decimals as strings (`"12.50"`); numbers are
/// accepted as well. Serialization always produces the string form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Multiply a unit price by a quantity.
    pub fn times(self, quantity: u32) -> Self {
        Self(self.0.saturating_mul(i64::from(quantity)))
    }

    /// Parse a decimal string like `"12.5"`, `"-3.05"` or `"7"`.
    /// Digits beyond the second decimal place are rounded half-up.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (negative, digits) = match input.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, input.strip_prefix('+').unwrap_or(input)),
        };

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut frac_digits = frac.bytes().map(|b| i64::from(b - b'0'));
        let tens = frac_digits.next().unwrap_or(0);
        let units = frac_digits.next().unwrap_or(0);
        let round_up = frac_digits.next().is_some_and(|d| d >= 5);

        let mut cents = whole.checked_mul(100)?.checked_add(tens * 10 + units)?;
        if round_up {
            cents = cents.checked_add(1)?;
        }
        Some(Self(if negative { -cents } else { cents }))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawMoney {
            Text(String),
            Integer(i64),
            Float(f64),
        }

        match RawMoney::deserialize(deserializer)? {
            RawMoney::Text(s) => Money::parse(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {s:?}"))),
            RawMoney::Integer(n) => n
                .checked_mul(100)
                .map(Money)
                .ok_or_else(|| serde::de::Error::custom("amount out of range")),
            RawMoney::Float(x) => Ok(Money((x * 100.0).round() as i64)),
        }
    }
}

// --- Sessions ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Locked,
    Completed,
    Archived,
    /// A status this client does not know about yet.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub status: SessionStatus,
    #[serde(default, deserialize_with = "opt_id_from_string_or_number")]
    pub table: Option<String>,
    #[serde(default, deserialize_with = "opt_id_from_string_or_number")]
    pub table_number: Option<String>,
    /// When the server will archive the session, once it has completed.
    #[serde(default)]
    pub archive_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Partial session fields carried by `session_update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(
        default,
        deserialize_with = "opt_id_from_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub table_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_deadline: Option<DateTime<Utc>>,
}

impl SessionPatch {
    /// Overwrite the fields present in this patch, leaving the rest untouched.
    pub fn apply_to(&self, session: &mut Session) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(number) = &self.table_number {
            session.table_number = Some(number.clone());
        }
        if let Some(deadline) = self.archive_deadline {
            session.archive_deadline = Some(deadline);
        }
    }
}

// --- Participants ---

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    #[default]
    Approved,
    Rejected,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(alias = "name")]
    pub display_name: String,
    #[serde(default)]
    pub status: ApprovalStatus,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

// --- Shared cart ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartItem {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    /// Identifier of the participant who owns this line.
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub participant: String,
    pub participant_name: String,
    pub menu_item: i64,
    pub menu_item_name: String,
    pub menu_item_price: Money,
    #[serde(default)]
    pub menu_item_image: Option<String>,
    pub quantity: u32,
    #[serde(default)]
    pub special_instructions: String,
    #[serde(default)]
    pub customizations: serde_json::Map<String, serde_json::Value>,
    /// Server-computed line total, including any customization surcharges.
    pub total_price: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CartItem {
    pub fn line_total(&self) -> Money {
        self.total_price
    }
}

/// The full shared cart as returned by the cart endpoint and pushed by
/// `cart_state` / `cart_update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CartSnapshot {
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub total: Money,
    #[serde(default)]
    pub items_count: u32,
}

/// Request body for adding a line to the shared cart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddCartItem {
    pub menu_item: i64,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizations: Option<serde_json::Map<String, serde_json::Value>>,
}

impl AddCartItem {
    pub fn new(menu_item: i64, quantity: u32) -> Self {
        Self {
            menu_item,
            quantity,
            special_instructions: None,
            customizations: None,
        }
    }

    pub fn with_instructions(mut self, text: impl Into<String>) -> Self {
        self.special_instructions = Some(text.into());
        self
    }

    pub fn with_customizations(mut self, map: serde_json::Map<String, serde_json::Value>) -> Self {
        self.customizations = Some(map);
        self
    }
}

/// Partial update of an existing cart line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdateCartItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizations: Option<serde_json::Map<String, serde_json::Value>>,
}

// --- Orders ---

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Served,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderLine {
    pub menu_item_name: String,
    pub quantity: u32,
    #[serde(default)]
    pub total_price: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_id_from_string_or_number")]
    pub order_number: Option<String>,
    #[serde(default, deserialize_with = "opt_id_from_string_or_number")]
    pub participant: Option<String>,
    #[serde(default)]
    pub participant_name: Option<String>,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub total_amount: Money,
    #[serde(default)]
    pub items: Vec<OrderLine>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Full session state: the `session_state` payload and the session endpoint body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub session: Session,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub orders: Vec<Order>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_parses_backend_decimals() {
        assert_eq!(Money::parse("12.50"), Some(Money::from_cents(1250)));
        assert_eq!(Money::parse("7"), Some(Money::from_cents(700)));
        assert_eq!(Money::parse("0.5"), Some(Money::from_cents(50)));
        assert_eq!(Money::parse("-3.05"), Some(Money::from_cents(-305)));
        assert_eq!(Money::parse("1.005"), Some(Money::from_cents(101)));
        assert_eq!(Money::parse("abc"), None);
        assert_eq!(Money::parse("."), None);
    }

    #[test]
    fn money_displays_two_decimals() {
        assert_eq!(Money::from_cents(1250).to_string(), "12.50");
        assert_eq!(Money::from_cents(-50).to_string(), "-0.50");
        assert_eq!(Money::from_cents(3).to_string(), "0.03");
    }

    #[test]
    fn money_accepts_strings_and_numbers() {
        let from_str: Money = serde_json::from_str("\"4.20\"").unwrap();
        let from_int: Money = serde_json::from_str("4").unwrap();
        let from_float: Money = serde_json::from_str("4.2").unwrap();
        assert_eq!(from_str, Money::from_cents(420));
        assert_eq!(from_int, Money::from_cents(400));
        assert_eq!(from_float, Money::from_cents(420));
        assert_eq!(serde_json::to_string(&from_str).unwrap(), "\"4.20\"");
    }

    #[test]
    fn cart_item_accepts_numeric_ids() {
        let item: CartItem = serde_json::from_value(serde_json::json!({
            "id": 41,
            "participant": "p-1",
            "participant_name": "Ana",
            "menu_item": 7,
            "menu_item_name": "Tacos",
            "menu_item_price": "4.50",
            "quantity": 2,
            "total_price": "9.00",
            "created_at": "2024-05-01T12:00:00Z",
            "updated_at": "2024-05-01T12:00:00Z"
        }))
        .unwrap();

        assert_eq!(item.id, "41");
        assert_eq!(item.line_total(), item.menu_item_price.times(2));
        assert!(item.customizations.is_empty());
    }

    #[test]
    fn session_patch_only_touches_present_fields() {
        let mut session = Session {
            id: "s1".into(),
            status: SessionStatus::Active,
            table: Some("3".into()),
            table_number: Some("12".into()),
            archive_deadline: None,
            created_at: None,
        };
        let patch = SessionPatch {
            status: Some(SessionStatus::Locked),
            ..Default::default()
        };
        patch.apply_to(&mut session);

        assert_eq!(session.status, SessionStatus::Locked);
        assert_eq!(session.table_number.as_deref(), Some("12"));
    }

    #[test]
    fn unknown_statuses_do_not_fail_parsing() {
        let status: SessionStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(status, SessionStatus::Unknown);
    }
}
