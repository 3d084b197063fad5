// src/sources/wikidata.rs
//! Wikidata SPARQL lookup: cause (P509), manner (P1196) and place (P20) of
//! death for humans whose English label equals the subject name.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;

use crate::error::{LookupError, LookupResult};
use crate::source::{FetchContext, Source, SourceAnswer};
use crate::text::normalize_text;
use crate::types::{
    DeathFields, EnrichmentPayload, EnrichmentSubject, ReliabilityTier, SourceCategory,
    SourceDescriptor,
};

const ENDPOINT: &str = "https://query.wikidata.org/sparql";

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<BTreeMap<String, Binding>>,
}

#[derive(Debug, Deserialize)]
struct Binding {
    value: String,
}

/// Everything the query returned for one Wikidata item.
#[derive(Debug, Default)]
struct Person {
    death_dates: Vec<NaiveDate>,
    birth_dates: Vec<NaiveDate>,
    causes: Vec<String>,
    manners: Vec<String>,
    places: Vec<String>,
}

pub struct WikidataSource {
    descriptor: SourceDescriptor,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        endpoint: String,
        client: reqwest::Client,
    },
}

impl WikidataSource {
    fn default_descriptor() -> SourceDescriptor {
        SourceDescriptor::new(
            "wikidata",
            "Wikidata",
            ReliabilityTier::StructuredData,
            SourceCategory::StructuredData,
        )
        .min_delay(Duration::from_millis(500))
        .cache_ttl(Some(Duration::from_secs(30 * 24 * 3600)))
        .max_confidence(1.0)
    }

    /// Answer every query with a canned SPARQL JSON body.
    pub fn from_fixture_str(body: &str) -> Self {
        Self {
            descriptor: Self::default_descriptor(),
            mode: Mode::Fixture(body.to_string()),
        }
    }

    pub fn new(timeout: Duration) -> LookupResult<Self> {
        Self::with_endpoint(ENDPOINT, timeout)
    }

    pub fn with_endpoint(endpoint: &str, timeout: Duration) -> LookupResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Unavailable(format!("wikidata client: {e}")))?;
        Ok(Self {
            descriptor: Self::default_descriptor(),
            mode: Mode::Http {
                endpoint: endpoint.to_string(),
                client,
            },
        })
    }

    pub fn sparql_for(name: &str) -> String {
        let escaped = name.trim().replace('\\', "\\\\").replace('"', "\\\"");
        format!(
            r#"SELECT ?person ?dod ?dob ?causeLabel ?mannerLabel ?placeLabel WHERE {{
  ?person rdfs:label "{escaped}"@en ; wdt:P31 wd:Q5 ; wdt:P570 ?dod .
  OPTIONAL {{ ?person wdt:P569 ?dob . }}
  OPTIONAL {{ ?person wdt:P509 ?cause . }}
  OPTIONAL {{ ?person wdt:P1196 ?manner . }}
  OPTIONAL {{ ?person wdt:P20 ?place . }}
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language "en". }}
}} LIMIT 50"#
        )
    }

    fn group_people(body: &str) -> LookupResult<BTreeMap<String, Person>> {
        let parsed: SparqlResponse = serde_json::from_str(body)
            .map_err(|e| LookupError::Transient(format!("bad sparql response: {e}")))?;
        let mut people: BTreeMap<String, Person> = BTreeMap::new();
        for row in parsed.results.bindings {
            let Some(id) = row.get("person").map(|b| b.value.clone()) else {
                continue;
            };
            let p = people.entry(id).or_default();
            push_date(&mut p.death_dates, row.get("dod"));
            push_date(&mut p.birth_dates, row.get("dob"));
            push_label(&mut p.causes, row.get("causeLabel"));
            push_label(&mut p.manners, row.get("mannerLabel"));
            push_label(&mut p.places, row.get("placeLabel"));
        }
        Ok(people)
    }

    /// Pick the item that is this subject. A death-date match is exact; a
    /// lone candidate without dates to compare is accepted as non-exact.
    fn answer_from(subject: &EnrichmentSubject, body: &str) -> LookupResult<SourceAnswer> {
        let people = Self::group_people(body)?;
        if people.is_empty() {
            return Err(LookupError::no_data(format!("no wikidata item for {}", subject.name)));
        }

        let (id, person, exact) = match subject.death_date {
            Some(dod) => {
                let mut matching = people.iter().filter(|(_, p)| p.death_dates.contains(&dod));
                match (matching.next(), matching.next()) {
                    (Some((id, p)), None) => (id, p, true),
                    (Some(_), Some(_)) => {
                        return Err(LookupError::no_data("several items share the death date"))
                    }
                    (None, _) => return Err(LookupError::no_data("no item with a matching death date")),
                }
            }
            None if people.len() == 1 => {
                let (id, p) = people.iter().next().ok_or_else(|| LookupError::no_data("empty"))?;
                (id, p, false)
            }
            None => {
                return Err(LookupError::no_data(format!(
                    "{} items named {}, no death date to disambiguate",
                    people.len(),
                    subject.name
                )))
            }
        };

        let fields = DeathFields {
            cause: join(&person.causes),
            manner: join(&person.manners),
            location: person.places.first().cloned(),
            ..Default::default()
        };
        let mut raw = serde_json::json!({
            "item": id,
            "death_dates": person.death_dates,
            "causes": person.causes,
            "manners": person.manners,
            "places": person.places,
        });
        if let (Some(dob), true) = (subject.birth_date, !person.birth_dates.is_empty()) {
            raw["birth_matches"] = serde_json::json!(person.birth_dates.contains(&dob));
        }
        let payload = EnrichmentPayload {
            fields,
            source_url: Some(id.clone()),
        };
        Ok(SourceAnswer::new(payload, raw.to_string()).exact(exact))
    }
}

fn push_date(out: &mut Vec<NaiveDate>, b: Option<&Binding>) {
    // Wikidata times look like "2001-05-03T00:00:00Z".
    let Some(d) = b
        .and_then(|b| b.value.get(..10))
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    else {
        return;
    };
    if !out.contains(&d) {
        out.push(d);
    }
}

fn push_label(out: &mut Vec<String>, b: Option<&Binding>) {
    let Some(v) = b.map(|b| normalize_text(&b.value)) else {
        return;
    };
    // Unlabelled items come back as bare Q-ids or entity URLs.
    let unlabelled = v.starts_with("http") || (v.starts_with('Q') && v[1..].chars().all(|c| c.is_ascii_digit()));
    if !v.is_empty() && !unlabelled && !out.contains(&v) {
        out.push(v);
    }
}

fn join(items: &[String]) -> Option<String> {
    (!items.is_empty()).then(|| items.join("; "))
}

#[async_trait]
impl Source for WikidataSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn check_preconditions(&self, subject: &EnrichmentSubject) -> LookupResult<()> {
        if subject.name.trim().is_empty() {
            return Err(LookupError::PreconditionFailed("subject has no name".into()));
        }
        Ok(())
    }

    fn query_text(&self, subject: &EnrichmentSubject) -> String {
        match subject.death_date {
            Some(d) => format!("{}|{d}", subject.name.trim()),
            None => subject.name.trim().to_string(),
        }
    }

    async fn fetch(
        &self,
        subject: &EnrichmentSubject,
        _ctx: &FetchContext,
    ) -> LookupResult<SourceAnswer> {
        match &self.mode {
            Mode::Fixture(body) => Self::answer_from(subject, body),
            Mode::Http { endpoint, client } => {
                let query = Self::sparql_for(&subject.name);
                let body = client
                    .get(endpoint)
                    .query(&[("query", query.as_str()), ("format", "json")])
                    .header(reqwest::header::ACCEPT, "application/sparql-results+json")
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                debug!(target: "enrich::source", source = "wikidata", bytes = body.len(), "sparql answered");
                Self::answer_from(subject, &body)
            }
        }
    }

    fn confidence(&self, subject: &EnrichmentSubject, answer: &SourceAnswer) -> f64 {
        if answer.exact_match {
            let birth_conflict = subject.birth_date.is_some()
                && answer.raw_response.contains("\"birth_matches\":false");
            return if birth_conflict { 0.85 } else { 1.0 };
        }
        0.7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{"results":{"bindings":[
      {"person":{"type":"uri","value":"http://www.wikidata.org/entity/Q1"},
       "dod":{"type":"literal","value":"2001-05-03T00:00:00Z"},
       "dob":{"type":"literal","value":"1930-01-01T00:00:00Z"},
       "causeLabel":{"type":"literal","value":"lung cancer"},
       "mannerLabel":{"type":"literal","value":"natural causes"},
       "placeLabel":{"type":"literal","value":"Los Angeles"}},
      {"person":{"type":"uri","value":"http://www.wikidata.org/entity/Q2"},
       "dod":{"type":"literal","value":"1999-01-01T00:00:00Z"},
       "causeLabel":{"type":"literal","value":"Q12345"}}
    ]}}"#;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn death_date_selects_exact_item() {
        let s = EnrichmentSubject::new("1", "Jane Doe").died(d(2001, 5, 3));
        let a = WikidataSource::answer_from(&s, FIXTURE).unwrap();
        assert!(a.exact_match);
        assert_eq!(a.payload.fields.cause.as_deref(), Some("lung cancer"));
        assert_eq!(a.payload.fields.location.as_deref(), Some("Los Angeles"));
        assert_eq!(
            a.payload.source_url.as_deref(),
            Some("http://www.wikidata.org/entity/Q1")
        );
    }

    #[test]
    fn ambiguous_without_date_is_no_data() {
        let s = EnrichmentSubject::new("1", "Jane Doe");
        let err = WikidataSource::answer_from(&s, FIXTURE).unwrap_err();
        assert!(matches!(err, LookupError::NoDataFound(_)));
    }

    #[test]
    fn unlabelled_values_are_dropped() {
        let s = EnrichmentSubject::new("2", "Jane Doe").died(d(1999, 1, 1));
        let a = WikidataSource::answer_from(&s, FIXTURE).unwrap();
        assert!(a.payload.fields.cause.is_none());
        assert!(a.payload.is_empty());
    }

    #[test]
    fn birth_mismatch_lowers_confidence() {
        let src = WikidataSource::from_fixture_str(FIXTURE);
        let s = EnrichmentSubject::new("1", "Jane Doe")
            .born(d(1931, 1, 1))
            .died(d(2001, 5, 3));
        let a = WikidataSource::answer_from(&s, FIXTURE).unwrap();
        assert_eq!(src.confidence(&s, &a), 0.85);
    }

    #[test]
    fn sparql_escapes_quotes() {
        let q = WikidataSource::sparql_for(r#"Dwayne "The Rock" Johnson"#);
        assert!(q.contains(r#""Dwayne \"The Rock\" Johnson"@en"#));
    }
}
