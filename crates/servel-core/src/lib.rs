//! Core domain model for the SERVEL results sync service.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod seats;

pub const CRATE_NAME: &str = "servel-core";

/// Race covered by the sync. Numeric codes follow the upstream archive names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Election {
    Presidential,
    Senators,
    Deputies,
}

impl Election {
    pub const ALL: [Election; 3] = [Election::Presidential, Election::Senators, Election::Deputies];

    pub fn code(self) -> i64 {
        match self {
            Election::Presidential => 4,
            Election::Senators => 5,
            Election::Deputies => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Election::Presidential => "presidential",
            Election::Senators => "senators",
            Election::Deputies => "deputies",
        }
    }
}

impl fmt::Display for Election {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("unknown race `{0}`")]
    UnknownElection(String),
    #[error("unknown resource `{0}`")]
    UnknownResource(String),
}

impl FromStr for Election {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        if let Ok(code) = normalized.parse::<i64>() {
            return Self::from_code(code).ok_or_else(|| KeyError::UnknownElection(s.to_string()));
        }
        match normalized.as_str() {
            "presidential" | "presidencial" => Ok(Election::Presidential),
            "senators" | "senadores" => Ok(Election::Senators),
            "deputies" | "diputados" => Ok(Election::Deputies),
            _ => Err(KeyError::UnknownElection(s.to_string())),
        }
    }
}

/// Identifies one syncable upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ResourceKey {
    Territories,
    Installation,
    Totals(Election),
    Tables(Election),
}

impl ResourceKey {
    /// Every resource for the given races, in sync order.
    pub fn catalog(elections: &[Election]) -> Vec<ResourceKey> {
        let mut keys = vec![ResourceKey::Territories, ResourceKey::Installation];
        keys.extend(elections.iter().map(|e| ResourceKey::Totals(*e)));
        keys.extend(elections.iter().map(|e| ResourceKey::Tables(*e)));
        keys
    }

    /// Per-table dumps and the territory listing run into tens of thousands of rows.
    pub fn is_large(self) -> bool {
        matches!(self, ResourceKey::Territories | ResourceKey::Tables(_))
    }

    pub fn election(self) -> Option<Election> {
        match self {
            ResourceKey::Totals(e) | ResourceKey::Tables(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Territories => f.write_str("territories"),
            ResourceKey::Installation => f.write_str("installation"),
            ResourceKey::Totals(e) => write!(f, "totals-{e}"),
            ResourceKey::Tables(e) => write!(f, "tables-{e}"),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "territories" => return Ok(ResourceKey::Territories),
            "installation" => return Ok(ResourceKey::Installation),
            _ => {}
        }
        let unknown = || KeyError::UnknownResource(s.to_string());
        let (kind, race) = trimmed.split_once('-').ok_or_else(unknown)?;
        let election = race.parse::<Election>().map_err(|_| unknown())?;
        match kind {
            "totals" => Ok(ResourceKey::Totals(election)),
            "tables" => Ok(ResourceKey::Tables(election)),
            _ => Err(unknown()),
        }
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Persisted sync bookkeeping for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub key: ResourceKey,
    pub archive: String,
    pub last_marker: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Geographic placement of one voting table. Reference data keyed by `id_mesa`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Territory {
    #[serde(deserialize_with = "de_id")]
    pub id_mesa: String,
    pub id_region: i64,
    pub region: String,
    pub orden_region: Option<i64>,
    pub id_cirsen: Option<i64>,
    pub glosacirsen: Option<String>,
    pub id_distrito: Option<i64>,
    pub distrito: Option<String>,
    pub id_provincia: Option<i64>,
    pub provincia: Option<String>,
    pub id_comuna: i64,
    pub comuna: String,
    pub id_local: Option<i64>,
    pub local: Option<String>,
    #[serde(deserialize_with = "de_id")]
    pub mesa: String,
    pub cupos_presidencial: Option<i64>,
    pub cupos_senadores: Option<i64>,
    pub cupos_diputados: Option<i64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// Votes for one candidate at one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateVote {
    pub id_candidato: i64,
    pub id_partido: Option<i64>,
    pub id_pacto: Option<i64>,
    pub id_subpacto: Option<i64>,
    #[serde(default, deserialize_with = "de_count")]
    pub votos: i64,
    pub orden_voto: Option<i64>,
    #[serde(default, deserialize_with = "de_count")]
    pub electo: i64,
}

/// Tally of one voting table for one race. Keyed by (`cod_eleccion`, `id_mesa`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableResult {
    #[serde(default)]
    pub cod_eleccion: i64,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub iteracion: Option<String>,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub porcentaje: Option<String>,
    pub id_region: Option<i64>,
    pub id_cirsen: Option<i64>,
    pub id_distrito: Option<i64>,
    pub id_provincia: Option<i64>,
    pub id_circ_provincial: Option<i64>,
    pub id_comuna: Option<i64>,
    pub id_local: Option<i64>,
    #[serde(deserialize_with = "de_id")]
    pub id_mesa: String,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub mesa: Option<String>,
    pub envio: Option<String>,
    #[serde(default, deserialize_with = "de_count")]
    pub instalada: i64,
    #[serde(default, deserialize_with = "de_count")]
    pub blancos: i64,
    #[serde(default, deserialize_with = "de_count")]
    pub nulos: i64,
    #[serde(default, deserialize_with = "de_count")]
    pub total_emitidos: i64,
    #[serde(default, deserialize_with = "de_count")]
    pub total_general: i64,
    #[serde(default, deserialize_with = "de_count")]
    pub electores: i64,
    #[serde(default)]
    pub candidatos: Vec<CandidateVote>,
}

impl TableResult {
    pub fn is_installed(&self) -> bool {
        self.instalada != 0
    }

    /// A table counts once it reports at least one ballot.
    pub fn is_counted(&self) -> bool {
        self.total_emitidos > 0
    }
}

/// Installation flag for one table, as published in the installation feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationStatus {
    #[serde(deserialize_with = "de_id")]
    pub id_mesa: String,
    #[serde(default, deserialize_with = "de_count")]
    pub instalada: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationReport {
    #[serde(default, deserialize_with = "de_opt_text")]
    pub iteracion: Option<String>,
    #[serde(default, alias = "porc", deserialize_with = "de_opt_text")]
    pub porcentaje: Option<String>,
    #[serde(default, alias = "totalMesas", deserialize_with = "de_count")]
    pub total_mesas: i64,
    #[serde(default, alias = "totalInstaladas", deserialize_with = "de_count")]
    pub instaladas: i64,
    #[serde(default)]
    pub mesas: Vec<InstallationStatus>,
}

impl InstallationReport {
    /// Reported completion, falling back to the counts when no percentage is published.
    pub fn completion_percent(&self) -> Option<f64> {
        if let Some(pct) = self.porcentaje.as_deref().and_then(parse_percentage) {
            return Some(pct);
        }
        if self.total_mesas > 0 {
            return Some(self.instaladas as f64 * 100.0 / self.total_mesas as f64);
        }
        if self.mesas.is_empty() {
            return None;
        }
        let installed = self.mesas.iter().filter(|m| m.instalada != 0).count();
        Some(installed as f64 * 100.0 / self.mesas.len() as f64)
    }
}

/// Parses upstream percentages such as `"99,6"`, `"99.60 %"` or `"100"`.
pub fn parse_percentage(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().trim_end_matches('%').trim().replace(',', ".");
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Per-race rollup snapshot keyed by (`id_eleccion`, `name`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub id_eleccion: i64,
    pub name: String,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub iteracion: Option<String>,
    #[serde(default, rename = "votosValidos", deserialize_with = "de_count")]
    pub votos_validos: i64,
    #[serde(default, deserialize_with = "de_count")]
    pub nulos: i64,
    #[serde(default, deserialize_with = "de_count")]
    pub blancos: i64,
    #[serde(default, rename = "totalEscrutadas", deserialize_with = "de_count")]
    pub total_escrutadas: i64,
    #[serde(default, rename = "totalVotacion", deserialize_with = "de_count")]
    pub total_votacion: i64,
    #[serde(default, rename = "totalMesas", deserialize_with = "de_count")]
    pub total_mesas: i64,
    #[serde(default, rename = "totalInstaladas", deserialize_with = "de_count")]
    pub total_instaladas: i64,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub porc: Option<String>,
    #[serde(default)]
    pub detalles: Vec<AggregateDetail>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// One entry of an aggregate breakdown. The upstream shape differs per race,
/// so unknown shapes are kept verbatim in `Raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateDetail {
    Group(GroupDetail),
    Candidate(CandidateDetail),
    Raw(JsonValue),
}

/// A pact or list with its parties and candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDetail {
    #[serde(default, alias = "id_lista")]
    pub id_pacto: Option<i64>,
    #[serde(default, alias = "glosa_pacto", alias = "lista", deserialize_with = "de_opt_text")]
    pub pacto: Option<String>,
    #[serde(default, deserialize_with = "de_count")]
    pub votos: i64,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub porc: Option<String>,
    #[serde(default)]
    pub partidos: Vec<PartyDetail>,
    pub candidatos: Vec<CandidateDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyDetail {
    pub id_partido: Option<i64>,
    pub sigla_partido: Option<String>,
    pub partido: Option<String>,
    #[serde(default, deserialize_with = "de_count")]
    pub votos: i64,
    #[serde(default)]
    pub candidatos: Vec<CandidateDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDetail {
    pub id: i64,
    pub candidato: String,
    pub sigla_partido: Option<String>,
    pub orden: Option<i64>,
    #[serde(default, deserialize_with = "de_count")]
    pub electo: i64,
    #[serde(default, deserialize_with = "de_count")]
    pub votos: i64,
    #[serde(default, deserialize_with = "de_opt_text")]
    pub porc: Option<String>,
    #[serde(rename = "filterName")]
    pub filter_name: Option<String>,
}

impl AggregateResult {
    /// Every candidate entry in the breakdown, flat or nested under groups and parties.
    pub fn candidate_details(&self) -> Vec<&CandidateDetail> {
        let mut out = Vec::new();
        for detail in &self.detalles {
            match detail {
                AggregateDetail::Group(group) => {
                    out.extend(group.candidatos.iter());
                    for party in &group.partidos {
                        out.extend(party.candidatos.iter());
                    }
                }
                AggregateDetail::Candidate(candidate) => out.push(candidate),
                AggregateDetail::Raw(_) => {}
            }
        }
        out
    }

    /// Pact display names declared by the group entries.
    pub fn pact_names(&self) -> Vec<(i64, String)> {
        self.detalles
            .iter()
            .filter_map(|detail| match detail {
                AggregateDetail::Group(GroupDetail {
                    id_pacto: Some(id),
                    pacto: Some(name),
                    ..
                }) if !name.trim().is_empty() => Some((*id, name.trim().to_string())),
                _ => None,
            })
            .collect()
    }
}

/// Deduplicated candidate identity extracted while ingesting aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    pub candidato: String,
    pub sigla_partido: Option<String>,
    pub orden: Option<i64>,
    pub electo: i64,
    #[serde(rename = "filterName")]
    pub filter_name: Option<String>,
}

impl From<&CandidateDetail> for Candidate {
    fn from(detail: &CandidateDetail) -> Self {
        Self {
            id: detail.id,
            candidato: detail.candidato.clone(),
            sigla_partido: detail.sigla_partido.clone(),
            orden: detail.orden,
            electo: detail.electo,
            filter_name: detail.filter_name.clone(),
        }
    }
}

/// Unique candidates across snapshots; a later occurrence of an id replaces earlier ones.
pub fn extract_candidates(results: &[AggregateResult]) -> Vec<Candidate> {
    let mut by_id = BTreeMap::new();
    for result in results {
        for detail in result.candidate_details() {
            by_id.insert(detail.id, Candidate::from(detail));
        }
    }
    by_id.into_values().collect()
}

/// Whether `incoming` may replace a snapshot stamped with `stored`.
///
/// Markers compare by length first, then lexicographically, which orders both
/// the numeric and the timestamp markers the upstream publishes.
pub fn marker_not_older(incoming: Option<&str>, stored: Option<&str>) -> bool {
    match (incoming, stored) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(new), Some(old)) => (new.len(), new) >= (old.len(), old),
    }
}

/// Geographic unit a seat summary is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum GeoUnit {
    District(i64),
    Circumscription(i64),
}

impl GeoUnit {
    pub fn contains(&self, table: &TableResult) -> bool {
        match self {
            GeoUnit::District(id) => table.id_distrito == Some(*id),
            GeoUnit::Circumscription(id) => table.id_cirsen == Some(*id),
        }
    }

    pub fn contains_territory(&self, territory: &Territory) -> bool {
        match self {
            GeoUnit::District(id) => territory.id_distrito == Some(*id),
            GeoUnit::Circumscription(id) => territory.id_cirsen == Some(*id),
        }
    }
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number identifier, got {other}"
        ))),
    }
}

fn de_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected text or number, got {other}"
        ))),
    }
}

/// Counts arrive as numbers, numeric strings or null.
fn de_count<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(0),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| serde::de::Error::custom(format!("count out of range: {n}"))),
        Some(JsonValue::Bool(b)) => Ok(i64::from(b)),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(0),
        Some(JsonValue::String(s)) => s
            .trim()
            .replace('.', "")
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid count `{s}`"))),
        Some(other) => Err(serde::de::Error::custom(format!("invalid count {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_keys_round_trip_through_text() {
        for key in ResourceKey::catalog(&Election::ALL) {
            let text = key.to_string();
            assert_eq!(text.parse::<ResourceKey>().unwrap(), key);
        }
        assert_eq!("tables-6".parse::<ResourceKey>().unwrap(), ResourceKey::Tables(Election::Deputies));
        assert!("tables-mayors".parse::<ResourceKey>().is_err());
        assert!("ballots".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn election_accepts_names_and_codes() {
        assert_eq!("4".parse::<Election>().unwrap(), Election::Presidential);
        assert_eq!("Diputados".parse::<Election>().unwrap(), Election::Deputies);
        assert!("9".parse::<Election>().is_err());
    }

    #[test]
    fn table_result_tolerates_loose_upstream_types() {
        let table: TableResult = serde_json::from_value(json!({
            "cod_eleccion": 6,
            "iteracion": 17,
            "id_distrito": 8,
            "id_mesa": 120044,
            "mesa": "12A",
            "instalada": "1",
            "blancos": null,
            "nulos": 3,
            "total_emitidos": "210",
            "candidatos": [
                {"id_candidato": 91, "id_pacto": 2, "votos": 120, "orden_voto": 1, "electo": 0}
            ]
        }))
        .unwrap();

        assert_eq!(table.id_mesa, "120044");
        assert_eq!(table.iteracion.as_deref(), Some("17"));
        assert_eq!(table.blancos, 0);
        assert_eq!(table.total_emitidos, 210);
        assert!(table.is_installed());
        assert!(table.is_counted());
        assert_eq!(table.candidatos[0].votos, 120);
    }

    #[test]
    fn aggregate_details_fall_back_to_raw_for_unknown_shapes() {
        let result: AggregateResult = serde_json::from_value(json!({
            "id_eleccion": 4,
            "name": "nacional",
            "iteracion": "0003",
            "votosValidos": 1000,
            "detalles": [
                {
                    "id_pacto": 7,
                    "pacto": "Unidad Norte",
                    "votos": 600,
                    "candidatos": [
                        {"id": 1, "candidato": "ANA ROJAS", "sigla_partido": "PN", "orden": 1, "votos": 600}
                    ]
                },
                {"id": 2, "candidato": "LUIS SOTO", "orden": 2, "votos": 400, "electo": 1},
                {"resumen": "sin detalle"}
            ]
        }))
        .unwrap();

        assert!(matches!(result.detalles[0], AggregateDetail::Group(_)));
        assert!(matches!(result.detalles[1], AggregateDetail::Candidate(_)));
        assert!(matches!(result.detalles[2], AggregateDetail::Raw(_)));
        assert_eq!(result.pact_names(), vec![(7, "Unidad Norte".to_string())]);
        assert_eq!(result.candidate_details().len(), 2);
    }

    #[test]
    fn candidate_extraction_deduplicates_by_id() {
        let detail = |id: i64, electo: i64| {
            json!({"id": id, "candidato": format!("C{id}"), "orden": id, "electo": electo})
        };
        let a: AggregateResult = serde_json::from_value(json!({
            "id_eleccion": 4, "name": "nacional", "detalles": [detail(1, 0), detail(2, 0)]
        }))
        .unwrap();
        let b: AggregateResult = serde_json::from_value(json!({
            "id_eleccion": 4, "name": "extranjero", "detalles": [detail(2, 1)]
        }))
        .unwrap();

        let candidates = extract_candidates(&[a, b]);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].id, 2);
        assert_eq!(candidates[1].electo, 1);
    }

    #[test]
    fn installation_percentage_prefers_published_value() {
        let report: InstallationReport = serde_json::from_value(json!({
            "iteracion": "5", "porc": "99,6", "totalMesas": 10, "totalInstaladas": 2
        }))
        .unwrap();
        assert_eq!(report.completion_percent(), Some(99.6));

        let counted: InstallationReport =
            serde_json::from_value(json!({"totalMesas": 200, "totalInstaladas": 150})).unwrap();
        assert_eq!(counted.completion_percent(), Some(75.0));

        assert_eq!(parse_percentage("99.50 %"), Some(99.5));
        assert_eq!(parse_percentage("n/a"), None);
    }

    #[test]
    fn marker_ordering_handles_numeric_and_missing_markers() {
        assert!(marker_not_older(Some("10"), Some("9")));
        assert!(!marker_not_older(Some("9"), Some("10")));
        assert!(marker_not_older(Some("9"), Some("9")));
        assert!(marker_not_older(None, None));
        assert!(!marker_not_older(None, Some("1")));
    }
}
