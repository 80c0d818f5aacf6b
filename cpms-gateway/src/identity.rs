//! Charger identity validation
//!
//! The identity directory lives outside this engine; the gateway only asks it
//! whether a connecting identity is known.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::IdentityError;

/// Directory entry for a known charger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargerRecord {
    /// Platform id of the charger
    pub charger_id: String,
    /// Identity the charger presents on the wire
    pub charger_code: String,
}

/// Accept/reject lookup for connecting chargers
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    /// `Ok(None)` for an unknown identity; `Err` only when the lookup itself failed
    async fn lookup(&self, identity: &str) -> Result<Option<ChargerRecord>, IdentityError>;
}

/// Fixed allow-list
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    records: HashMap<String, ChargerRecord>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `code`, reported downstream under platform id `charger_id`
    pub fn with_charger(mut self, code: impl Into<String>, charger_id: impl Into<String>) -> Self {
        let code = code.into();
        self.records.insert(
            code.clone(),
            ChargerRecord {
                charger_id: charger_id.into(),
                charger_code: code,
            },
        );
        self
    }

    /// Allow each identity, using the identity as platform id too
    pub fn from_identities<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        identities.into_iter().fold(Self::new(), |dir, code| {
            let code = code.into();
            dir.with_charger(code.clone(), code)
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdentityValidator for StaticDirectory {
    async fn lookup(&self, identity: &str) -> Result<Option<ChargerRecord>, IdentityError> {
        Ok(self.records.get(identity).cloned())
    }
}

/// Accepts any identity (development and simulator setups)
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl IdentityValidator for AcceptAll {
    async fn lookup(&self, identity: &str) -> Result<Option<ChargerRecord>, IdentityError> {
        Ok(Some(ChargerRecord {
            charger_id: identity.to_string(),
            charger_code: identity.to_string(),
        }))
    }
}
