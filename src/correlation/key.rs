use crate::constants::correlation::{
    CODEC_MESSAGE_ID, CODEC_SERVICE_ID, INVALID_MARKERS, MESSAGE_ID, MOBILE_ID, STAGE,
    STAGE_DELIVERY, STAGE_RESPONSE, STAGE_SUBMISSION, SUBMISSION_ID,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Searchable attribute set routing an external event to a waiting instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey {
    attributes: BTreeMap<String, String>,
}

impl CorrelationKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(name.into(), value.to_string());
        self
    }

    /// Key held while waiting for the network to accept the submission
    pub fn submission(submission_id: Uuid) -> Self {
        Self::new()
            .with(STAGE, STAGE_SUBMISSION)
            .with(SUBMISSION_ID, submission_id)
    }

    /// Key held while waiting for a delivery state change
    pub fn delivery(message_id: u64) -> Self {
        Self::new()
            .with(STAGE, STAGE_DELIVERY)
            .with(MESSAGE_ID, message_id)
    }

    /// Key held while waiting for the device's reply
    pub fn response(mobile_id: &str, codec_service_id: u8, codec_message_id: u8) -> Self {
        Self::new()
            .with(STAGE, STAGE_RESPONSE)
            .with(MOBILE_ID, mobile_id)
            .with(CODEC_SERVICE_ID, codec_service_id)
            .with(CODEC_MESSAGE_ID, codec_message_id)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn stage(&self) -> Option<&str> {
        self.get(STAGE)
    }

    /// True when every attribute of `query` is present here with the same value
    pub fn matches(&self, query: &CorrelationKey) -> bool {
        !query.attributes.is_empty()
            && query
                .attributes
                .iter()
                .all(|(name, value)| self.attributes.get(name) == Some(value))
    }

    /// Sentinel values or a response key without a mobile id
    pub fn is_malformed(&self) -> bool {
        let sentinel = self.attributes.values().any(|value| {
            INVALID_MARKERS
                .iter()
                .any(|marker| value.trim().eq_ignore_ascii_case(marker))
        });
        let missing_mobile =
            self.stage() == Some(STAGE_RESPONSE) && !self.attributes.contains_key(MOBILE_ID);
        sentinel || missing_mobile
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .attributes
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_match() {
        let key = CorrelationKey::response("01459438SKYFEE3", 0, 112);
        let query = CorrelationKey::new()
            .with(MOBILE_ID, "01459438SKYFEE3")
            .with(CODEC_MESSAGE_ID, 112);
        assert!(key.matches(&query));

        let wrong = CorrelationKey::new().with(MOBILE_ID, "00000000SKY0000");
        assert!(!key.matches(&wrong));
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        assert!(!CorrelationKey::delivery(5).matches(&CorrelationKey::new()));
    }

    #[test]
    fn test_stage_separates_keys() {
        let delivery = CorrelationKey::delivery(123);
        let submission_query = CorrelationKey::new()
            .with(STAGE, STAGE_SUBMISSION)
            .with(MESSAGE_ID, 123);
        assert!(!delivery.matches(&submission_query));
    }

    #[test]
    fn test_malformed_keys() {
        assert!(CorrelationKey::response("undefined", 0, 70).is_malformed());
        assert!(CorrelationKey::new().with(STAGE, STAGE_RESPONSE).is_malformed());
        assert!(!CorrelationKey::delivery(9).is_malformed());
    }
}
