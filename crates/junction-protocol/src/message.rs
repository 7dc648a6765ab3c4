//! WAMP message types for Junction.
//!
//! Messages are the fundamental unit of communication between peers and the
//! router. On the wire every message is an array whose first element is the
//! message type code, so conversion goes through [`serde_json::Value`] and any
//! serializer that can represent a JSON value can carry it.

use serde_json::Value;

use crate::codec::ProtocolError;

/// A WAMP identifier (sessions, requests, registrations, subscriptions, ...).
pub type Id = u64;

/// A WAMP URI (realms, topics, procedures, error and close reasons).
pub type Uri = String;

/// Keyword arguments, details and options.
pub type Dict = serde_json::Map<String, Value>;

/// Positional arguments.
pub type List = Vec<Value>;

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    Welcome = 2,
    Abort = 3,
    Goodbye = 6,
    Error = 8,
    Publish = 16,
    Published = 17,
    Subscribe = 32,
    Subscribed = 33,
    Unsubscribe = 34,
    Unsubscribed = 35,
    Event = 36,
    Call = 48,
    Result = 50,
    Register = 64,
    Registered = 65,
    Unregister = 66,
    Unregistered = 67,
    Invocation = 68,
    Yield = 70,
}

impl From<MessageType> for u64 {
    fn from(mt: MessageType) -> u64 {
        mt as u64
    }
}

impl TryFrom<u64> for MessageType {
    type Error = &'static str;

    fn try_from(value: u64) -> Result<Self, <Self as TryFrom<u64>>::Error> {
        match value {
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::Welcome),
            3 => Ok(MessageType::Abort),
            6 => Ok(MessageType::Goodbye),
            8 => Ok(MessageType::Error),
            16 => Ok(MessageType::Publish),
            17 => Ok(MessageType::Published),
            32 => Ok(MessageType::Subscribe),
            33 => Ok(MessageType::Subscribed),
            34 => Ok(MessageType::Unsubscribe),
            35 => Ok(MessageType::Unsubscribed),
            36 => Ok(MessageType::Event),
            48 => Ok(MessageType::Call),
            50 => Ok(MessageType::Result),
            64 => Ok(MessageType::Register),
            65 => Ok(MessageType::Registered),
            66 => Ok(MessageType::Unregister),
            67 => Ok(MessageType::Unregistered),
            68 => Ok(MessageType::Invocation),
            70 => Ok(MessageType::Yield),
            _ => Err("Invalid message type"),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Session open request.
    Hello { realm: Uri, details: Dict },

    /// Session accepted.
    Welcome { session: Id, details: Dict },

    /// Session refused or torn down before it was established.
    Abort { details: Dict, reason: Uri },

    /// Session close, sent by either side and echoed by the other.
    Goodbye { details: Dict, reason: Uri },

    /// Failure reply to a request of `request_type`.
    Error {
        request_type: MessageType,
        request: Id,
        details: Dict,
        error: Uri,
        arguments: List,
        arguments_kw: Dict,
    },

    Publish {
        request: Id,
        options: Dict,
        topic: Uri,
        arguments: List,
        arguments_kw: Dict,
    },

    Published { request: Id, publication: Id },

    Subscribe {
        request: Id,
        options: Dict,
        topic: Uri,
    },

    Subscribed { request: Id, subscription: Id },

    Unsubscribe { request: Id, subscription: Id },

    Unsubscribed { request: Id },

    /// Delivery of a publication to a subscriber.
    Event {
        subscription: Id,
        publication: Id,
        details: Dict,
        arguments: List,
        arguments_kw: Dict,
    },

    Call {
        request: Id,
        options: Dict,
        procedure: Uri,
        arguments: List,
        arguments_kw: Dict,
    },

    Result {
        request: Id,
        details: Dict,
        arguments: List,
        arguments_kw: Dict,
    },

    Register {
        request: Id,
        options: Dict,
        procedure: Uri,
    },

    Registered { request: Id, registration: Id },

    Unregister { request: Id, registration: Id },

    Unregistered { request: Id },

    /// A call routed by the dealer to the callee.
    Invocation {
        request: Id,
        registration: Id,
        details: Dict,
        arguments: List,
        arguments_kw: Dict,
    },

    /// The callee's answer to an invocation.
    Yield {
        request: Id,
        options: Dict,
        arguments: List,
        arguments_kw: Dict,
    },
}

impl Message {
    /// Get the message type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::Welcome { .. } => MessageType::Welcome,
            Message::Abort { .. } => MessageType::Abort,
            Message::Goodbye { .. } => MessageType::Goodbye,
            Message::Error { .. } => MessageType::Error,
            Message::Publish { .. } => MessageType::Publish,
            Message::Published { .. } => MessageType::Published,
            Message::Subscribe { .. } => MessageType::Subscribe,
            Message::Subscribed { .. } => MessageType::Subscribed,
            Message::Unsubscribe { .. } => MessageType::Unsubscribe,
            Message::Unsubscribed { .. } => MessageType::Unsubscribed,
            Message::Event { .. } => MessageType::Event,
            Message::Call { .. } => MessageType::Call,
            Message::Result { .. } => MessageType::Result,
            Message::Register { .. } => MessageType::Register,
            Message::Registered { .. } => MessageType::Registered,
            Message::Unregister { .. } => MessageType::Unregister,
            Message::Unregistered { .. } => MessageType::Unregistered,
            Message::Invocation { .. } => MessageType::Invocation,
            Message::Yield { .. } => MessageType::Yield,
        }
    }

    /// The request id a router reply answers, if this message is a reply.
    #[must_use]
    pub fn reply_to(&self) -> Option<Id> {
        match self {
            Message::Error { request, .. }
            | Message::Published { request, .. }
            | Message::Subscribed { request, .. }
            | Message::Unsubscribed { request }
            | Message::Result { request, .. }
            | Message::Registered { request, .. }
            | Message::Unregistered { request } => Some(*request),
            _ => None,
        }
    }

    /// Create a new Hello message.
    #[must_use]
    pub fn hello(realm: impl Into<Uri>, details: Dict) -> Self {
        Message::Hello {
            realm: realm.into(),
            details,
        }
    }

    /// Create a new Abort message.
    #[must_use]
    pub fn abort(reason: impl Into<Uri>) -> Self {
        Message::Abort {
            details: Dict::new(),
            reason: reason.into(),
        }
    }

    /// Create a new Abort message carrying a human readable explanation.
    #[must_use]
    pub fn abort_with_message(reason: impl Into<Uri>, message: impl Into<String>) -> Self {
        let mut details = Dict::new();
        details.insert("message".into(), Value::String(message.into()));
        Message::Abort {
            details,
            reason: reason.into(),
        }
    }

    /// Create a new Goodbye message.
    #[must_use]
    pub fn goodbye(reason: impl Into<Uri>) -> Self {
        Message::Goodbye {
            details: Dict::new(),
            reason: reason.into(),
        }
    }

    /// Create an Error reply without payload.
    #[must_use]
    pub fn error(request_type: MessageType, request: Id, error: impl Into<Uri>) -> Self {
        Message::Error {
            request_type,
            request,
            details: Dict::new(),
            error: error.into(),
            arguments: List::new(),
            arguments_kw: Dict::new(),
        }
    }

    /// Convert the message into its array representation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut items = vec![Value::from(u64::from(self.message_type()))];

        match self {
            Message::Hello { realm, details } => {
                items.push(Value::from(realm.as_str()));
                items.push(Value::Object(details.clone()));
            }
            Message::Welcome { session, details } => {
                items.push(Value::from(*session));
                items.push(Value::Object(details.clone()));
            }
            Message::Abort { details, reason } | Message::Goodbye { details, reason } => {
                items.push(Value::Object(details.clone()));
                items.push(Value::from(reason.as_str()));
            }
            Message::Error {
                request_type,
                request,
                details,
                error,
                arguments,
                arguments_kw,
            } => {
                items.push(Value::from(u64::from(*request_type)));
                items.push(Value::from(*request));
                items.push(Value::Object(details.clone()));
                items.push(Value::from(error.as_str()));
                push_payload(&mut items, arguments, arguments_kw);
            }
            Message::Publish {
                request,
                options,
                topic,
                arguments,
                arguments_kw,
            } => {
                items.push(Value::from(*request));
                items.push(Value::Object(options.clone()));
                items.push(Value::from(topic.as_str()));
                push_payload(&mut items, arguments, arguments_kw);
            }
            Message::Published {
                request,
                publication,
            } => {
                items.push(Value::from(*request));
                items.push(Value::from(*publication));
            }
            Message::Subscribe {
                request,
                options,
                topic,
            } => {
                items.push(Value::from(*request));
                items.push(Value::Object(options.clone()));
                items.push(Value::from(topic.as_str()));
            }
            Message::Subscribed {
                request,
                subscription,
            }
            | Message::Unsubscribe {
                request,
                subscription,
            } => {
                items.push(Value::from(*request));
                items.push(Value::from(*subscription));
            }
            Message::Unsubscribed { request } | Message::Unregistered { request } => {
                items.push(Value::from(*request));
            }
            Message::Event {
                subscription,
                publication,
                details,
                arguments,
                arguments_kw,
            } => {
                items.push(Value::from(*subscription));
                items.push(Value::from(*publication));
                items.push(Value::Object(details.clone()));
                push_payload(&mut items, arguments, arguments_kw);
            }
            Message::Call {
                request,
                options,
                procedure,
                arguments,
                arguments_kw,
            } => {
                items.push(Value::from(*request));
                items.push(Value::Object(options.clone()));
                items.push(Value::from(procedure.as_str()));
                push_payload(&mut items, arguments, arguments_kw);
            }
            Message::Result {
                request,
                details,
                arguments,
                arguments_kw,
            } => {
                items.push(Value::from(*request));
                items.push(Value::Object(details.clone()));
                push_payload(&mut items, arguments, arguments_kw);
            }
            Message::Register {
                request,
                options,
                procedure,
            } => {
                items.push(Value::from(*request));
                items.push(Value::Object(options.clone()));
                items.push(Value::from(procedure.as_str()));
            }
            Message::Registered {
                request,
                registration,
            }
            | Message::Unregister {
                request,
                registration,
            } => {
                items.push(Value::from(*request));
                items.push(Value::from(*registration));
            }
            Message::Invocation {
                request,
                registration,
                details,
                arguments,
                arguments_kw,
            } => {
                items.push(Value::from(*request));
                items.push(Value::from(*registration));
                items.push(Value::Object(details.clone()));
                push_payload(&mut items, arguments, arguments_kw);
            }
            Message::Yield {
                request,
                options,
                arguments,
                arguments_kw,
            } => {
                items.push(Value::from(*request));
                items.push(Value::Object(options.clone()));
                push_payload(&mut items, arguments, arguments_kw);
            }
        }

        Value::Array(items)
    }

    /// Build a message from its array representation.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] if the value is not an array, the
    /// type code is unknown, or a required field is missing or mistyped.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Array(items) = value else {
            return Err(ProtocolError::Invalid("message is not an array".into()));
        };
        let mut fields = Fields(items.into_iter());

        let code = fields.id("message type")?;
        let message_type = MessageType::try_from(code)
            .map_err(|_| ProtocolError::Invalid(format!("unknown message type {code}")))?;

        let message = match message_type {
            MessageType::Hello => Message::Hello {
                realm: fields.uri("realm")?,
                details: fields.dict("details")?,
            },
            MessageType::Welcome => Message::Welcome {
                session: fields.id("session")?,
                details: fields.dict("details")?,
            },
            MessageType::Abort => Message::Abort {
                details: fields.dict("details")?,
                reason: fields.uri("reason")?,
            },
            MessageType::Goodbye => Message::Goodbye {
                details: fields.dict("details")?,
                reason: fields.uri("reason")?,
            },
            MessageType::Error => {
                let request_code = fields.id("request type")?;
                Message::Error {
                    request_type: MessageType::try_from(request_code).map_err(|_| {
                        ProtocolError::Invalid(format!("unknown request type {request_code}"))
                    })?,
                    request: fields.id("request")?,
                    details: fields.dict("details")?,
                    error: fields.uri("error")?,
                    arguments: fields.list()?,
                    arguments_kw: fields.kwargs()?,
                }
            }
            MessageType::Publish => Message::Publish {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                topic: fields.uri("topic")?,
                arguments: fields.list()?,
                arguments_kw: fields.kwargs()?,
            },
            MessageType::Published => Message::Published {
                request: fields.id("request")?,
                publication: fields.id("publication")?,
            },
            MessageType::Subscribe => Message::Subscribe {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                topic: fields.uri("topic")?,
            },
            MessageType::Subscribed => Message::Subscribed {
                request: fields.id("request")?,
                subscription: fields.id("subscription")?,
            },
            MessageType::Unsubscribe => Message::Unsubscribe {
                request: fields.id("request")?,
                subscription: fields.id("subscription")?,
            },
            MessageType::Unsubscribed => Message::Unsubscribed {
                request: fields.id("request")?,
            },
            MessageType::Event => Message::Event {
                subscription: fields.id("subscription")?,
                publication: fields.id("publication")?,
                details: fields.dict("details")?,
                arguments: fields.list()?,
                arguments_kw: fields.kwargs()?,
            },
            MessageType::Call => Message::Call {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                procedure: fields.uri("procedure")?,
                arguments: fields.list()?,
                arguments_kw: fields.kwargs()?,
            },
            MessageType::Result => Message::Result {
                request: fields.id("request")?,
                details: fields.dict("details")?,
                arguments: fields.list()?,
                arguments_kw: fields.kwargs()?,
            },
            MessageType::Register => Message::Register {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                procedure: fields.uri("procedure")?,
            },
            MessageType::Registered => Message::Registered {
                request: fields.id("request")?,
                registration: fields.id("registration")?,
            },
            MessageType::Unregister => Message::Unregister {
                request: fields.id("request")?,
                registration: fields.id("registration")?,
            },
            MessageType::Unregistered => Message::Unregistered {
                request: fields.id("request")?,
            },
            MessageType::Invocation => Message::Invocation {
                request: fields.id("request")?,
                registration: fields.id("registration")?,
                details: fields.dict("details")?,
                arguments: fields.list()?,
                arguments_kw: fields.kwargs()?,
            },
            MessageType::Yield => Message::Yield {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                arguments: fields.list()?,
                arguments_kw: fields.kwargs()?,
            },
        };

        Ok(message)
    }
}

/// Append trailing payload fields, omitting empty ones from the end.
fn push_payload(items: &mut Vec<Value>, arguments: &List, arguments_kw: &Dict) {
    if !arguments_kw.is_empty() {
        items.push(Value::Array(arguments.clone()));
        items.push(Value::Object(arguments_kw.clone()));
    } else if !arguments.is_empty() {
        items.push(Value::Array(arguments.clone()));
    }
}

/// Sequential reader over the elements of a message array.
struct Fields(std::vec::IntoIter<Value>);

impl Fields {
    fn next(&mut self, name: &str) -> Result<Value, ProtocolError> {
        self.0
            .next()
            .ok_or_else(|| ProtocolError::Invalid(format!("missing {name}")))
    }

    fn id(&mut self, name: &str) -> Result<Id, ProtocolError> {
        self.next(name)?
            .as_u64()
            .ok_or_else(|| ProtocolError::Invalid(format!("{name} is not an id")))
    }

    fn uri(&mut self, name: &str) -> Result<Uri, ProtocolError> {
        match self.next(name)? {
            Value::String(s) => Ok(s),
            _ => Err(ProtocolError::Invalid(format!("{name} is not a uri"))),
        }
    }

    fn dict(&mut self, name: &str) -> Result<Dict, ProtocolError> {
        match self.next(name)? {
            Value::Object(map) => Ok(map),
            _ => Err(ProtocolError::Invalid(format!("{name} is not a dict"))),
        }
    }

    fn list(&mut self) -> Result<List, ProtocolError> {
        match self.0.next() {
            None => Ok(List::new()),
            Some(Value::Array(list)) => Ok(list),
            Some(_) => Err(ProtocolError::Invalid("arguments is not a list".into())),
        }
    }

    fn kwargs(&mut self) -> Result<Dict, ProtocolError> {
        match self.0.next() {
            None => Ok(Dict::new()),
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(ProtocolError::Invalid("arguments_kw is not a dict".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type() {
        let hello = Message::hello("realm1", Dict::new());
        assert_eq!(hello.message_type(), MessageType::Hello);

        let goodbye = Message::goodbye("wamp.close.normal");
        assert_eq!(goodbye.message_type(), MessageType::Goodbye);
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(48), Ok(MessageType::Call));
        assert_eq!(MessageType::try_from(70), Ok(MessageType::Yield));
        assert!(MessageType::try_from(4).is_err());
        assert_eq!(u64::from(MessageType::Event), 36);
    }

    #[test]
    fn test_empty_payload_is_omitted() {
        let publish = Message::Publish {
            request: 1,
            options: Dict::new(),
            topic: "dev.time".into(),
            arguments: List::new(),
            arguments_kw: Dict::new(),
        };
        assert_eq!(publish.to_value(), json!([16, 1, {}, "dev.time"]));

        let with_args = Message::Publish {
            request: 2,
            options: Dict::new(),
            topic: "dev.time".into(),
            arguments: vec![json!("now")],
            arguments_kw: Dict::new(),
        };
        assert_eq!(with_args.to_value(), json!([16, 2, {}, "dev.time", ["now"]]));
    }

    #[test]
    fn test_kwargs_force_arguments() {
        let mut kwargs = Dict::new();
        kwargs.insert("k".into(), json!(1));
        let result = Message::Result {
            request: 7,
            details: Dict::new(),
            arguments: List::new(),
            arguments_kw: kwargs,
        };
        assert_eq!(result.to_value(), json!([50, 7, {}, [], {"k": 1}]));
    }

    #[test]
    fn test_decode_call_without_payload() {
        let msg = Message::from_value(json!([48, 9, {}, "dev.echo"])).unwrap();
        match msg {
            Message::Call {
                request,
                procedure,
                arguments,
                arguments_kw,
                ..
            } => {
                assert_eq!(request, 9);
                assert_eq!(procedure, "dev.echo");
                assert!(arguments.is_empty());
                assert!(arguments_kw.is_empty());
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_message() {
        let msg = Message::from_value(json!([
            8,
            64,
            3,
            {},
            "wamp.error.procedure_already_exists"
        ]))
        .unwrap();
        assert_eq!(msg.reply_to(), Some(3));
        assert_eq!(
            msg,
            Message::error(MessageType::Register, 3, "wamp.error.procedure_already_exists")
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(Message::from_value(json!({"type": 1})).is_err());
        assert!(Message::from_value(json!([99, 1])).is_err());
        assert!(Message::from_value(json!([1, "realm1"])).is_err());
        assert!(Message::from_value(json!([2, "not-an-id", {}])).is_err());
        assert!(Message::from_value(json!([48, 1, {}, "p", {"not": "a list"}])).is_err());
    }
}
