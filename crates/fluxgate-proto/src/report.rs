//! Reports pushed by agents over the HTTP ingestion endpoints.

use serde::{Deserialize, Serialize};

/// Service name agents use for their own management API; never billed.
pub const MANAGEMENT_SERVICE: &str = "web_api";

/// Per-service byte counters since the previous report.
///
/// `v` distinguishes protocol generations: absent or `0` is the legacy
/// agent, which only fills `u`/`d`; `1` and later also fill the dial-side
/// counters `du`/`dd`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowReport {
    #[serde(rename = "n")]
    pub name: String,
    /// Client -> proxy.
    #[serde(rename = "u", default)]
    pub upload: i64,
    /// Proxy -> client.
    #[serde(rename = "d", default)]
    pub download: i64,
    /// Proxy -> target.
    #[serde(rename = "du", default)]
    pub dial_upload: i64,
    /// Target -> proxy.
    #[serde(rename = "dd", default)]
    pub dial_download: i64,
    #[serde(rename = "v", default)]
    pub version: u32,
}

impl FlowReport {
    pub fn is_management(&self) -> bool {
        self.name == MANAGEMENT_SERVICE
    }

    /// Parse a request body holding one report or an array of reports.
    pub fn parse_batch(body: &[u8]) -> Result<Vec<Self>, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Batch {
            Many(Vec<FlowReport>),
            One(FlowReport),
        }
        Ok(match serde_json::from_slice::<Batch>(body)? {
            Batch::Many(reports) => reports,
            Batch::One(report) => vec![report],
        })
    }
}

/// The services an agent is currently running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigReport {
    #[serde(default)]
    pub services: Vec<ReportedService>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedService {
    pub name: String,
    #[serde(default)]
    pub addr: String,
}
