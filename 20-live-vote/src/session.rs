//! Session and option metadata.
//!
//! Plain reads and writes against the same store the counters live in. Nothing
//! here races with voting: metadata is written once at creation and never
//! updated, and counters are seeded with `"0"` so every vote's first
//! compare-and-swap has a concrete value to compare against.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;

use crate::{
    aggregate::{aggregate, ResultsSnapshot},
    error::VoteError,
    keys::{Keyspace, OptionId, SessionId},
    store::KvStore,
};

/// Largest number of options a single session may offer.
pub const MAX_OPTIONS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub created_at: f64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionRecord {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSession {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedSession {
    pub session_id: String,
    pub info: SessionInfo,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub id: String,
    pub info: SessionInfo,
    pub options: Vec<OptionRecord>,
    pub results: ResultsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<SessionInfo>,
}

#[derive(Clone)]
pub struct SessionDirectory {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
}

impl SessionDirectory {
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub async fn create(&self, request: NewSession) -> Result<CreatedSession, VoteError> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(VoteError::MalformedPayload("title is required".into()));
        }
        if request.options.is_empty() {
            return Err(VoteError::MalformedPayload(
                "at least one option is required".into(),
            ));
        }
        if request.options.len() > MAX_OPTIONS {
            return Err(VoteError::MalformedPayload(format!(
                "at most {MAX_OPTIONS} options are allowed"
            )));
        }

        let session = SessionId::parse(&nanoid::nanoid!())?;
        let info = SessionInfo {
            title: title.to_string(),
            description: request.description.unwrap_or_default(),
            created_at: unix_seconds(),
            active: true,
        };
        self.store
            .put(&self.keys.info_key(&session), &encode(&info)?)
            .await?;

        for (index, text) in request.options.iter().enumerate() {
            let option = u32::try_from(index + 1)
                .map(OptionId)
                .map_err(|_| VoteError::MalformedPayload("too many options".into()))?;
            let record = OptionRecord {
                id: option.to_string(),
                text: text.clone(),
            };
            self.store
                .put(&self.keys.option_key(&session, option), &encode(&record)?)
                .await?;
            self.store
                .put(&self.keys.result_key(&session, option), "0")
                .await?;
        }

        info!(%session, options = request.options.len(), "session created");
        Ok(CreatedSession {
            session_id: session.to_string(),
            info,
            options: request.options,
        })
    }

    pub async fn get(&self, session: &SessionId) -> Result<SessionDetail, VoteError> {
        let info_key = self.keys.info_key(session);
        let info = match self.store.get(&info_key).await? {
            Some(raw) => decode::<SessionInfo>(&info_key, &raw)?,
            None => return Err(VoteError::NotFound),
        };

        let mut options = Vec::new();
        for (key, raw) in self.store.get_prefix(&self.keys.options_prefix(session)).await? {
            options.push(decode::<OptionRecord>(&key, &raw)?);
        }
        options.sort_by_key(|option| option.id.parse::<u32>().unwrap_or(u32::MAX));

        let results = aggregate(self.store.as_ref(), &self.keys, session).await?;

        Ok(SessionDetail {
            id: session.to_string(),
            info,
            options,
            results,
        })
    }

    /// Lists every session with stored metadata, grouped from a single scan.
    pub async fn list(&self) -> Result<Vec<SessionSummary>, VoteError> {
        let mut sessions: BTreeMap<String, Option<SessionInfo>> = BTreeMap::new();

        for (key, raw) in self.store.get_prefix(&self.keys.sessions_prefix()).await? {
            let Some(id) = self.keys.session_of(&key) else {
                continue;
            };
            let entry = sessions.entry(id.to_string()).or_default();
            if key.ends_with("/info") {
                *entry = Some(decode(&key, &raw)?);
            }
        }

        Ok(sessions
            .into_iter()
            .map(|(id, info)| SessionSummary { id, info })
            .collect())
    }

    /// Confirms the session has metadata before anything is streamed for it.
    pub async fn ensure_exists(&self, session: &SessionId) -> Result<(), VoteError> {
        match self.store.get(&self.keys.info_key(session)).await? {
            Some(_) => Ok(()),
            None => Err(VoteError::NotFound),
        }
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

fn encode<T: Serialize>(value: &T) -> Result<String, VoteError> {
    serde_json::to_string(value).map_err(|err| VoteError::MalformedPayload(err.to_string()))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, VoteError> {
    serde_json::from_str(raw).map_err(|err| VoteError::CorruptMetadata {
        key: key.to_string(),
        reason: err.to_string(),
    })
}
