//! Small aggregate used by the infra tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use userserver_core::{Aggregate, AggregateId, DomainError};
use userserver_events::Event;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerCommand {
    OpenLedger,
    Deposit { amount: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Opened { at: DateTime<Utc> },
    Deposited { amount: u64, at: DateTime<Utc> },
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::Opened { .. } => "ledger.opened",
            LedgerEvent::Deposited { .. } => "ledger.deposited",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::Opened { at } | LedgerEvent::Deposited { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    pub open: bool,
    pub balance: u64,
}

impl Ledger {
    pub fn empty(_id: &AggregateId) -> Self {
        Self {
            open: false,
            balance: 0,
        }
    }
}

impl Aggregate for Ledger {
    type Command = LedgerCommand;
    type Event = LedgerEvent;
    type Error = DomainError;

    fn aggregate_type() -> &'static str {
        "ledger"
    }

    fn command_types() -> &'static [&'static str] {
        &["OpenLedger", "Deposit"]
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::Opened { .. } => self.open = true,
            LedgerEvent::Deposited { amount, .. } => self.balance += amount,
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let at = Utc::now();
        match command {
            LedgerCommand::OpenLedger if self.open => {
                Err(DomainError::invariant("ledger already open"))
            }
            LedgerCommand::OpenLedger => Ok(vec![LedgerEvent::Opened { at }]),
            LedgerCommand::Deposit { .. } if !self.open => Err(DomainError::NotFound),
            LedgerCommand::Deposit { amount: 0 } => {
                Err(DomainError::validation("amount must be positive"))
            }
            LedgerCommand::Deposit { amount } => Ok(vec![LedgerEvent::Deposited {
                amount: *amount,
                at,
            }]),
        }
    }
}

pub fn ledger_id(s: &str) -> AggregateId {
    AggregateId::parse(s).unwrap()
}
