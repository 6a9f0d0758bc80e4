use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use userserver_core::{AggregateId, DomainError, PrincipalId};

/// A command targets a specific aggregate (intent, not fact).
///
/// Commands are **transient**: they live for one dispatch call and are turned
/// into events (which are persisted) or rejected.
///
/// ## Command vs Event
///
/// - **Command**: Intent to do something (e.g. "RegisterUser")
/// - **Event**: Fact that something happened (e.g. "user.registered")
///
/// ## Routing
///
/// `command_type` selects exactly one handler on the command bus; the payload is
/// opaque to the bus and only interpreted by that handler.
///
/// ## Typed payloads
///
/// Domain modules model their commands as an externally tagged serde enum
/// where the variant name is the command type:
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// enum UserCommand {
///     RegisterUser(RegisterUser),
///     ChangeEmailAddress(ChangeEmailAddress),
/// }
/// ```
///
/// `Command::typed` and `Command::decode` convert between that enum and the
/// untyped `(command_type, payload)` pair carried by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    command_type: String,
    aggregate_id: AggregateId,
    payload: JsonValue,
    principal: Option<PrincipalId>,
}

impl Command {
    pub fn new(
        command_type: impl Into<String>,
        aggregate_id: AggregateId,
        payload: JsonValue,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            aggregate_id,
            payload,
            principal: None,
        }
    }

    /// Encode a typed command enum into an untyped command.
    pub fn typed<C>(aggregate_id: AggregateId, command: &C) -> Result<Self, DomainError>
    where
        C: Serialize,
    {
        let encoded = serde_json::to_value(command)
            .map_err(|e| DomainError::validation(format!("command serialization failed: {e}")))?;

        match encoded {
            // Unit variants serialize as a bare string.
            JsonValue::String(command_type) => {
                Ok(Self::new(command_type, aggregate_id, JsonValue::Null))
            }
            JsonValue::Object(map) if map.len() == 1 => {
                let (command_type, payload) = map
                    .into_iter()
                    .next()
                    .ok_or_else(|| DomainError::validation("empty command encoding"))?;
                Ok(Self::new(command_type, aggregate_id, payload))
            }
            other => Err(DomainError::validation(format!(
                "command must be an externally tagged enum, got {other}"
            ))),
        }
    }

    /// Attach the issuing principal.
    pub fn issued_by(mut self, principal: PrincipalId) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Decode the payload into the handler's typed command enum.
    ///
    /// A payload that does not fit is a permanent client error.
    pub fn decode<C>(&self) -> Result<C, DomainError>
    where
        C: DeserializeOwned,
    {
        let tagged = if self.payload.is_null() {
            JsonValue::String(self.command_type.clone())
        } else {
            let mut map = serde_json::Map::with_capacity(1);
            map.insert(self.command_type.clone(), self.payload.clone());
            JsonValue::Object(map)
        };

        serde_json::from_value(tagged).map_err(|e| {
            DomainError::validation(format!("malformed {} payload: {e}", self.command_type))
        })
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn principal(&self) -> Option<&PrincipalId> {
        self.principal.as_ref()
    }
}
