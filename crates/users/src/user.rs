use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use userserver_core::{Aggregate, AggregateId, DomainError, DomainResult};
use userserver_events::Event;

const MAX_EMAIL_LEN: usize = 254;

/// Aggregate root: User.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    id: AggregateId,
    email: Option<String>,
    registered_at: Option<DateTime<Utc>>,
    version: u64,
}

impl User {
    /// Create an empty, not-yet-registered aggregate instance for rehydration.
    pub fn empty(id: &AggregateId) -> Self {
        Self {
            id: id.clone(),
            email: None,
            registered_at: None,
            version: 0,
        }
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn is_registered(&self) -> bool {
        self.registered_at.is_some()
    }

    /// Number of events applied so far.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterUser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUser {
    pub email: String,
}

/// Command: ChangeEmailAddress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEmailAddress {
    pub email: String,
}

/// Variant names are the command types routed by the command bus.
///
/// Commands carry no timestamps; events are stamped when they are decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserCommand {
    RegisterUser(RegisterUser),
    ChangeEmailAddress(ChangeEmailAddress),
}

/// Event: UserRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub email: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: EmailAddressChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddressChanged {
    pub previous: String,
    pub email: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserEvent {
    Registered(UserRegistered),
    EmailAddressChanged(EmailAddressChanged),
}

impl Event for UserEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UserEvent::Registered(_) => "user.registered",
            UserEvent::EmailAddressChanged(_) => "user.email_address_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            UserEvent::Registered(e) => e.occurred_at,
            UserEvent::EmailAddressChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for User {
    type Command = UserCommand;
    type Event = UserEvent;
    type Error = DomainError;

    fn aggregate_type() -> &'static str {
        "user"
    }

    fn command_types() -> &'static [&'static str] {
        &["RegisterUser", "ChangeEmailAddress"]
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            UserEvent::Registered(e) => {
                self.email = Some(e.email.clone());
                self.registered_at = Some(e.occurred_at);
            }
            UserEvent::EmailAddressChanged(e) => {
                self.email = Some(e.email.clone());
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let now = Utc::now();
        match command {
            UserCommand::RegisterUser(cmd) => self.handle_register(cmd, now),
            UserCommand::ChangeEmailAddress(cmd) => self.handle_change_email(cmd, now),
        }
    }
}

impl User {
    fn handle_register(
        &self,
        cmd: &RegisterUser,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<UserEvent>> {
        if self.is_registered() {
            return Err(DomainError::invariant("user already registered"));
        }

        Ok(vec![UserEvent::Registered(UserRegistered {
            email: normalize_email(&cmd.email)?,
            occurred_at: now,
        })])
    }

    fn handle_change_email(
        &self,
        cmd: &ChangeEmailAddress,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<UserEvent>> {
        let Some(previous) = &self.email else {
            return Err(DomainError::not_found());
        };

        let email = normalize_email(&cmd.email)?;
        // Same address again: nothing happened.
        if &email == previous {
            return Ok(vec![]);
        }

        Ok(vec![UserEvent::EmailAddressChanged(EmailAddressChanged {
            previous: previous.clone(),
            email,
            occurred_at: now,
        })])
    }
}

fn normalize_email(raw: &str) -> DomainResult<String> {
    let email = raw.trim().to_lowercase();

    if email.is_empty() {
        return Err(DomainError::validation("email cannot be empty"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(DomainError::validation("email is too long"));
    }

    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok(email)
        }
        _ => Err(DomainError::validation(format!("'{}' is not an email address", raw.trim()))),
    }
}
