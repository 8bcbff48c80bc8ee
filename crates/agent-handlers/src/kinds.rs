use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Wallet actions an agent can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Transfer,
    Swap,
    Bridge,
    Convert,
    Balance,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Transfer,
        Action::Swap,
        Action::Bridge,
        Action::Convert,
        Action::Balance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Swap => "swap",
            Self::Bridge => "bridge",
            Self::Convert => "convert",
            Self::Balance => "balance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transfer" | "send" | "send_payment" | "pay" => Some(Self::Transfer),
            "swap" | "swap_tokens" => Some(Self::Swap),
            "bridge" | "bridge_funds" => Some(Self::Bridge),
            "convert" | "currency_conversion" | "quote" => Some(Self::Convert),
            "balance" | "check_balance" | "portfolio" => Some(Self::Balance),
            _ => None,
        }
    }

    /// Whether executing the action moves funds out of the wallet.
    pub fn moves_funds(&self) -> bool {
        matches!(self, Self::Transfer | Self::Swap | Self::Bridge)
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or(())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The capability agents known to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Payment,
    Swap,
    Bridge,
    Conversion,
    Portfolio,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Payment,
        AgentKind::Swap,
        AgentKind::Bridge,
        AgentKind::Conversion,
        AgentKind::Portfolio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Swap => "swap",
            Self::Bridge => "bridge",
            Self::Conversion => "conversion",
            Self::Portfolio => "portfolio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "payment" | "payments" => Some(Self::Payment),
            "swap" => Some(Self::Swap),
            "bridge" => Some(Self::Bridge),
            "conversion" | "currency_conversion" => Some(Self::Conversion),
            "portfolio" | "balance" => Some(Self::Portfolio),
            _ => None,
        }
    }

    /// Actions the agent's handler knows how to execute, primary action first.
    pub fn actions(&self) -> &'static [Action] {
        match self {
            Self::Payment => &[Action::Transfer],
            Self::Swap => &[Action::Swap],
            Self::Bridge => &[Action::Bridge],
            Self::Conversion => &[Action::Convert],
            Self::Portfolio => &[Action::Balance],
        }
    }

    pub fn primary_action(&self) -> Action {
        self.actions()[0]
    }
}

impl FromStr for AgentKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or(())
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
