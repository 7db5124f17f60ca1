//! Content categories, freshness table and cacheability rules.

use super::key::CacheContext;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Cataract,
    Glaucoma,
    Myopia,
    Astigmatism,
    Conjunctivitis,
    DryEye,
    Retina,
    GeneralInfo,
    Appointment,
    Emergency,
    General,
}

const EMERGENCY_KEYWORDS: &[&str] = &["emergência", "emergencia", "urgente", "socorro"];

/// Checked in order; the first category with a matching keyword wins.
const TOPIC_KEYWORDS: &[(Category, &[&str])] = &[
    (Category::Cataract, &["catarata", "cataract", "visão turva", "embaçada"]),
    (Category::Glaucoma, &["glaucoma", "pressão ocular", "campo visual"]),
    (Category::Myopia, &["miopia", "myopia", "visão longe", "distante"]),
    (Category::Astigmatism, &["astigmatismo", "astigmatism", "visão distorcida"]),
    (Category::Conjunctivitis, &["conjuntivite", "olho vermelho", "irritação"]),
    (Category::DryEye, &["olho seco", "dry eye", "ressecamento"]),
    (Category::Retina, &["retina", "descolamento", "degeneração macular"]),
    (Category::GeneralInfo, &["informação", "o que é", "como funciona", "sintomas"]),
    (Category::Appointment, &["agendar", "consulta", "horário"]),
];

impl Category {
    pub const ALL: [Category; 11] = [
        Category::Cataract,
        Category::Glaucoma,
        Category::Myopia,
        Category::Astigmatism,
        Category::Conjunctivitis,
        Category::DryEye,
        Category::Retina,
        Category::GeneralInfo,
        Category::Appointment,
        Category::Emergency,
        Category::General,
    ];

    /// Classify a normalized message.
    ///
    /// Emergency wording (or an emergency context flag) always wins over
    /// topic keywords.
    pub fn classify(normalized: &str, context: &CacheContext) -> Self {
        if context.emergency_context || EMERGENCY_KEYWORDS.iter().any(|k| normalized.contains(k)) {
            return Category::Emergency;
        }
        TOPIC_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| normalized.contains(k)))
            .map(|(category, _)| *category)
            .unwrap_or(Category::General)
    }

    pub fn is_medical_topic(self) -> bool {
        matches!(
            self,
            Category::Cataract
                | Category::Glaucoma
                | Category::Myopia
                | Category::Astigmatism
                | Category::Conjunctivitis
                | Category::DryEye
                | Category::Retina
                | Category::GeneralInfo
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Cataract => "cataract",
            Category::Glaucoma => "glaucoma",
            Category::Myopia => "myopia",
            Category::Astigmatism => "astigmatism",
            Category::Conjunctivitis => "conjunctivitis",
            Category::DryEye => "dry_eye",
            Category::Retina => "retina",
            Category::GeneralInfo => "general_info",
            Category::Appointment => "appointment",
            Category::Emergency => "emergency",
            Category::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalDataKind {
    Cpf,
    Cnpj,
    Phone,
    Email,
}

/// Why a response was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Emergency answers have a zero TTL.
    Emergency,
    TooShort { chars: usize, min: usize },
    TooLong { chars: usize, max: usize },
    PersonalData { kind: PersonalDataKind },
    /// Appointment answers that mention a concrete date, time, weekday or month.
    SpecificDateTime,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Emergency => write!(f, "emergency responses are never cached"),
            RejectReason::TooShort { chars, min } => write!(f, "response too short ({chars} < {min} chars)"),
            RejectReason::TooLong { chars, max } => write!(f, "response too long ({chars} > {max} chars)"),
            RejectReason::PersonalData { kind } => write!(f, "response contains personal data ({kind:?})"),
            RejectReason::SpecificDateTime => write!(f, "appointment response mentions a specific date or time"),
        }
    }
}

static PERSONAL_DATA: Lazy<Vec<(PersonalDataKind, Regex)>> = Lazy::new(|| {
    [
        (PersonalDataKind::Cpf, r"\b\d{3}\.\d{3}\.\d{3}-\d{2}\b"),
        (PersonalDataKind::Cnpj, r"\b\d{2}\.\d{3}\.\d{3}/\d{4}-\d{2}\b"),
        (PersonalDataKind::Phone, r"\b\d{2}\s?\d{4,5}-?\d{4}\b"),
        (PersonalDataKind::Email, r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("static pattern")))
    .collect()
});

static DATE_TIME: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b\d{1,2}/\d{1,2}/\d{4}\b",
        r"\b\d{1,2}:\d{2}\b",
        r"(?i)(segunda|terça|quarta|quinta|sexta|sábado|domingo)",
        r"(?i)(janeiro|fevereiro|março|abril|maio|junho|julho|agosto|setembro|outubro|novembro|dezembro)",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("static pattern"))
    .collect()
});

/// Freshness table and storage rules.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub min_response_chars: usize,
    pub max_response_chars: usize,
    pub default_ttl: Duration,
    pub medical_ttl: Duration,
    pub appointment_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            min_response_chars: 50,
            max_response_chars: 5000,
            default_ttl: Duration::from_secs(24 * 3600),
            medical_ttl: Duration::from_secs(7 * 24 * 3600),
            appointment_ttl: Duration::from_secs(3600),
        }
    }
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl_for(&self, category: Category) -> Duration {
        match category {
            Category::Emergency => Duration::ZERO,
            Category::Appointment => self.appointment_ttl,
            c if c.is_medical_topic() => self.medical_ttl,
            _ => self.default_ttl,
        }
    }

    /// Returns the TTL to store with, or why the response must not be stored.
    pub fn admit(&self, response: &str, category: Category) -> Result<Duration, RejectReason> {
        let ttl = self.ttl_for(category);
        if ttl.is_zero() {
            return Err(RejectReason::Emergency);
        }
        let chars = response.chars().count();
        if chars < self.min_response_chars {
            return Err(RejectReason::TooShort {
                chars,
                min: self.min_response_chars,
            });
        }
        if chars > self.max_response_chars {
            return Err(RejectReason::TooLong {
                chars,
                max: self.max_response_chars,
            });
        }
        if let Some(kind) = personal_data(response) {
            return Err(RejectReason::PersonalData { kind });
        }
        if category == Category::Appointment && DATE_TIME.iter().any(|re| re.is_match(response)) {
            return Err(RejectReason::SpecificDateTime);
        }
        Ok(ttl)
    }
}

fn personal_data(text: &str) -> Option<PersonalDataKind> {
    PERSONAL_DATA
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(kind, _)| *kind)
}
