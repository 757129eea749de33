//! Application payload contract.
//!
//! Anything published as an event or exchanged through a method call
//! implements [`Message`]: a bus-wide numeric type id plus a byte encoding.
//! Subscribers and callers are matched against providers by that id alone,
//! so two types must never share one.
//!
//! The built-in types encode their value as decimal text. User types pick
//! their own encoding and reserve ids above [`FIRST_USER_TYPE_ID`].

/// Lowest type id available to application types.
pub const FIRST_USER_TYPE_ID: u32 = 11;

/// A type that can travel on the bus.
pub trait Message: Sized + Send + 'static {
    /// Bus-wide identifier checked on every subscribe and call.
    const TYPE_ID: u32;

    fn serialize(&self) -> Vec<u8>;

    fn deserialize(data: &[u8]) -> Result<Self, MessageError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload `{0}` is not a valid number")]
    InvalidNumber(String),

    #[error("expected an empty payload, got {0} bytes")]
    UnexpectedPayload(usize),

    #[error("{0}")]
    Custom(String),
}

/// Borrow a payload as text. METHOD_CALL and METHOD_RESPONSE carry payloads
/// inside JSON strings, so only UTF-8 payloads can cross them.
pub fn to_text(data: &[u8]) -> Result<&str, MessageError> {
    std::str::from_utf8(data).map_err(|_| MessageError::InvalidUtf8)
}

fn parse_number<T: std::str::FromStr>(data: &[u8]) -> Result<T, MessageError> {
    let text = to_text(data)?;
    text.trim()
        .parse()
        .map_err(|_| MessageError::InvalidNumber(text.to_string()))
}

// ── Built-in types ───────────────────────────────────────────────────────────

/// Empty payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullMsg;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Int32Msg(pub i32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Int64Msg(pub i64);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Float32Msg(pub f32);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Float64Msg(pub f64);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringMsg(pub String);

impl Message for NullMsg {
    const TYPE_ID: u32 = 1;

    fn serialize(&self) -> Vec<u8> {
        Vec::new()
    }

    fn deserialize(data: &[u8]) -> Result<Self, MessageError> {
        if data.is_empty() {
            Ok(NullMsg)
        } else {
            Err(MessageError::UnexpectedPayload(data.len()))
        }
    }
}

// Rust's `Display` for floats is the shortest text that parses back to the
// same value, so the numeric types share one implementation.
macro_rules! decimal_message {
    ($ty:ident, $inner:ty, $id:expr) => {
        impl Message for $ty {
            const TYPE_ID: u32 = $id;

            fn serialize(&self) -> Vec<u8> {
                self.0.to_string().into_bytes()
            }

            fn deserialize(data: &[u8]) -> Result<Self, MessageError> {
                parse_number::<$inner>(data).map($ty)
            }
        }

        impl From<$inner> for $ty {
            fn from(v: $inner) -> Self {
                $ty(v)
            }
        }
    };
}

decimal_message!(Int32Msg, i32, 2);
decimal_message!(Int64Msg, i64, 3);
decimal_message!(Float32Msg, f32, 4);
decimal_message!(Float64Msg, f64, 5);

impl Message for StringMsg {
    const TYPE_ID: u32 = 6;

    fn serialize(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    fn deserialize(data: &[u8]) -> Result<Self, MessageError> {
        to_text(data).map(|s| StringMsg(s.to_string()))
    }
}

impl From<&str> for StringMsg {
    fn from(s: &str) -> Self {
        StringMsg(s.to_string())
    }
}

impl From<String> for StringMsg {
    fn from(s: String) -> Self {
        StringMsg(s)
    }
}
