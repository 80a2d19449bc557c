//! People directory for the mention picker

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::TokenBroker;
use crate::types::error::{NotesError, Result};
use crate::types::{Audience, Person};

#[derive(Debug, Deserialize)]
struct UserPage {
    #[serde(default)]
    value: Vec<DirectoryUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryUser {
    display_name: Option<String>,
    mail: Option<String>,
    user_principal_name: Option<String>,
}

impl DirectoryUser {
    fn into_person(self) -> Option<Person> {
        let address = self
            .mail
            .filter(|m| !m.trim().is_empty())
            .or(self.user_principal_name)?;
        let display_name = self
            .display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| address.clone());
        Some(Person {
            display_name,
            address,
        })
    }
}

/// Lists people that can be mentioned
pub struct Directory {
    client: reqwest::Client,
    broker: Arc<TokenBroker>,
    users_url: String,
}

impl Directory {
    pub fn new(graph_base_url: &str, page_size: u32, broker: Arc<TokenBroker>) -> Self {
        Self {
            client: reqwest::Client::new(),
            broker,
            users_url: format!(
                "{}/users?$top={}&$select=displayName,mail,userPrincipalName",
                graph_base_url.trim_end_matches('/'),
                page_size
            ),
        }
    }

    /// People for the picker; failures yield an empty list
    pub async fn list_people(&self) -> Vec<Person> {
        match self.fetch().await {
            Ok(people) => {
                debug!("Directory returned {} people", people.len());
                people
            }
            Err(e) => {
                warn!("Failed to load directory: {}", e);
                Vec::new()
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<Person>> {
        let token = self.broker.acquire(Audience::Collaboration).await?;

        let response = self
            .client
            .get(&self.users_url)
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(NotesError::Network(format!("{}: {}", status, error_text)));
        }

        let page: UserPage = response
            .json()
            .await
            .map_err(|e| NotesError::Parse(e.to_string()))?;

        Ok(page
            .value
            .into_iter()
            .filter_map(DirectoryUser::into_person)
            .collect())
    }
}
