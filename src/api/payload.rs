use serde::Deserialize;

/// Body of `POST /runs/workflow`.
#[derive(Debug, Deserialize)]
pub struct WorkflowRunRequest {
    pub entity_id: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

/// Body of `POST /runs/chains/:name`.
#[derive(Debug, Deserialize)]
pub struct ChainRunRequest {
    pub entity_id: String,
}

pub fn parse<'a, T: Deserialize<'a>>(body: &'a [u8]) -> crate::error::Result<T> {
    Ok(serde_json::from_slice(body)?)
}
