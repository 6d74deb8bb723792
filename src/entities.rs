//! Regulatory entities and inbound sender classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A regulatory body that sends correspondence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: Uuid,
    pub nombre: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigla: Option<String>,
    /// Email domains the entity sends from, e.g. `supersalud.gov.co`.
    pub dominios: Vec<String>,
    /// Subject keywords used when no domain matches.
    #[serde(default)]
    pub palabras_clave: Vec<String>,
    pub activa: bool,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(nombre: impl Into<String>, dominios: &[&str]) -> Self {
        Self {
            id: Uuid::new_v4(),
            nombre: nombre.into(),
            sigla: None,
            dominios: dominios.iter().map(|d| d.to_lowercase()).collect(),
            palabras_clave: Vec::new(),
            activa: true,
            created_at: Utc::now(),
        }
    }

    /// Builder: set keywords.
    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.palabras_clave = keywords.iter().map(|k| k.to_lowercase()).collect();
        self
    }

    /// Builder: set acronym.
    pub fn with_sigla(mut self, sigla: impl Into<String>) -> Self {
        self.sigla = Some(sigla.into());
        self
    }

    /// Exact or subdomain match against the registered domains.
    pub fn owns_domain(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.dominios.iter().any(|d| {
            let d = d.trim_start_matches('@').to_lowercase();
            domain == d || domain.ends_with(&format!(".{d}"))
        })
    }

    fn matches_keyword(&self, text_lower: &str) -> bool {
        self.palabras_clave
            .iter()
            .any(|k| !k.is_empty() && text_lower.contains(&k.to_lowercase()))
    }
}

/// Domain part of an email address, lowercased.
///
/// Accepts bare addresses and `Name <user@domain>` forms.
pub fn sender_domain(address: &str) -> Option<String> {
    let addr = match (address.rfind('<'), address.rfind('>')) {
        (Some(start), Some(end)) if start < end => &address[start + 1..end],
        _ => address,
    };
    let (_, domain) = addr.trim().rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    if domain.is_empty() { None } else { Some(domain) }
}

/// Detect which active entity sent a message.
///
/// Sender domain wins; the subject keyword match is only a fallback.
pub fn detect_entity<'a>(entities: &'a [Entity], sender: &str, subject: &str) -> Option<&'a Entity> {
    let active = || entities.iter().filter(|e| e.activa);

    if let Some(domain) = sender_domain(sender)
        && let Some(e) = active().find(|e| e.owns_domain(&domain))
    {
        return Some(e);
    }

    let subject_lower = subject.to_lowercase();
    active().find(|e| e.matches_keyword(&subject_lower))
}
