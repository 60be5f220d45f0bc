use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Verdict assigned to a submission.
///
/// A submission starts out `PENDING` and moves to exactly one terminal
/// verdict; the store enforces that the transition happens once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pending,
    Ac,
    Wa,
    Tle,
    Mle,
    Re,
    Ce,
    Ie,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pending => "PENDING",
            Verdict::Ac => "AC",
            Verdict::Wa => "WA",
            Verdict::Tle => "TLE",
            Verdict::Mle => "MLE",
            Verdict::Re => "RE",
            Verdict::Ce => "CE",
            Verdict::Ie => "IE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Pending)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Verdict::Pending),
            "AC" => Ok(Verdict::Ac),
            "WA" => Ok(Verdict::Wa),
            "TLE" => Ok(Verdict::Tle),
            "MLE" => Ok(Verdict::Mle),
            "RE" => Ok(Verdict::Re),
            "CE" => Ok(Verdict::Ce),
            "IE" => Ok(Verdict::Ie),
            other => Err(anyhow::anyhow!("unknown verdict: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_roundtrip() {
        for v in [
            Verdict::Pending,
            Verdict::Ac,
            Verdict::Wa,
            Verdict::Tle,
            Verdict::Mle,
            Verdict::Re,
            Verdict::Ce,
            Verdict::Ie,
        ] {
            assert_eq!(v.to_string().parse::<Verdict>().unwrap(), v);
        }
    }

    #[test]
    fn test_terminal() {
        assert!(!Verdict::Pending.is_terminal());
        assert!(Verdict::Ac.is_terminal());
        assert!(Verdict::Ie.is_terminal());
    }

    #[test]
    fn test_unknown_verdict_rejected() {
        assert!("OK".parse::<Verdict>().is_err());
    }
}
