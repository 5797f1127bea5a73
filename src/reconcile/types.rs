use serde::Serialize;

use crate::store::Row;

/// Cross-store correlation produced by one confirmed chain step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationRecord {
    pub entity_id: String,
    /// Key the step looked up with.
    pub source_key: String,
    /// Key handed to the next step.
    pub derived_key: String,
    /// Name of the step that confirmed it.
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead: Option<LeadRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChainOutcome {
    /// Every step confirmed.
    Completed { records: Vec<ReconciliationRecord> },
    /// A step found its record already in place; later steps were skipped.
    AlreadyReconciled {
        step: String,
        key: String,
        records: Vec<ReconciliationRecord>,
    },
}

impl ChainOutcome {
    pub fn records(&self) -> &[ReconciliationRecord] {
        match self {
            ChainOutcome::Completed { records } => records,
            ChainOutcome::AlreadyReconciled { records, .. } => records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum LeadStatus {
    ReadyToAdd,
    Added,
    Other(String),
}

impl LeadStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "READY_TO_ADD" => LeadStatus::ReadyToAdd,
            "ADDED" => LeadStatus::Added,
            other => LeadStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LeadStatus::ReadyToAdd => "READY_TO_ADD",
            LeadStatus::Added => "ADDED",
            LeadStatus::Other(s) => s,
        }
    }
}

impl From<LeadStatus> for String {
    fn from(status: LeadStatus) -> Self {
        status.as_str().to_string()
    }
}

/// A dialer lead as seen in the calling store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadRecord {
    pub entity_id: String,
    pub campaign_id: Option<String>,
    pub status: LeadStatus,
}

impl LeadRecord {
    /// Rows without a `status` column are not leads.
    pub fn from_row(entity_id: &str, row: &Row) -> Option<Self> {
        let status = row.get("status")?;
        Some(Self {
            entity_id: entity_id.to_string(),
            campaign_id: row.get("campaign_id").map(str::to_string),
            status: LeadStatus::parse(status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_status_parse() {
        assert_eq!(LeadStatus::parse("READY_TO_ADD"), LeadStatus::ReadyToAdd);
        assert_eq!(LeadStatus::parse("ADDED"), LeadStatus::Added);
        assert_eq!(
            LeadStatus::parse("FAILED"),
            LeadStatus::Other("FAILED".to_string())
        );
        assert_eq!(LeadStatus::parse("FAILED").as_str(), "FAILED");
    }

    #[test]
    fn test_lead_from_row() {
        let row = Row::new()
            .with("status", "ADDED")
            .with("campaign_id", "QA_CAMPAIGN");
        let lead = LeadRecord::from_row("app-1", &row).unwrap();
        assert_eq!(lead.status, LeadStatus::Added);
        assert_eq!(lead.campaign_id.as_deref(), Some("QA_CAMPAIGN"));

        assert!(LeadRecord::from_row("app-1", &Row::new().with("lan", "LN1")).is_none());
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let outcome = ChainOutcome::Completed {
            records: vec![ReconciliationRecord {
                entity_id: "app-1".to_string(),
                source_key: "app-1".to_string(),
                derived_key: "LN1".to_string(),
                stage: "create_lead".to_string(),
                lead: Some(LeadRecord {
                    entity_id: "app-1".to_string(),
                    campaign_id: None,
                    status: LeadStatus::ReadyToAdd,
                }),
            }],
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["records"][0]["derived_key"], "LN1");
        assert_eq!(json["records"][0]["lead"]["status"], "READY_TO_ADD");
    }
}
