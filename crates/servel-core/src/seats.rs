//! Seat-allocation summaries computed at query time from per-table records.

use std::collections::HashMap;

use serde::Serialize;

use crate::{AggregateResult, Candidate, Election, GeoUnit, TableResult};

/// Display names needed to label a summary.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    candidates: HashMap<i64, Candidate>,
    pacts: HashMap<i64, String>,
}

impl Directory {
    pub fn new(candidates: &[Candidate], aggregates: &[AggregateResult]) -> Self {
        let candidates = candidates.iter().map(|c| (c.id, c.clone())).collect();
        let pacts = aggregates.iter().flat_map(|a| a.pact_names()).collect();
        Self { candidates, pacts }
    }

    pub fn pact_name(&self, pact_id: i64) -> String {
        self.pacts
            .get(&pact_id)
            .cloned()
            .unwrap_or_else(|| format!("Pact {pact_id}"))
    }

    fn candidate_name(&self, candidate_id: i64) -> String {
        self.candidates
            .get(&candidate_id)
            .map(|c| c.candidato.clone())
            .unwrap_or_else(|| format!("Candidate {candidate_id}"))
    }

    fn candidate_party(&self, candidate_id: i64) -> Option<String> {
        self.candidates
            .get(&candidate_id)
            .and_then(|c| c.sigla_partido.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeatSummary {
    pub election: Election,
    pub unit: GeoUnit,
    pub tables_total: usize,
    pub tables_counted: usize,
    pub tables_installed: usize,
    pub tables_counted_pct: String,
    pub total_ballots: i64,
    pub blank: i64,
    pub null: i64,
    pub valid_votes: i64,
    pub pacts: Vec<PactTally>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PactTally {
    pub pact_id: i64,
    pub name: String,
    pub votes: i64,
    pub share: String,
    pub candidates: Vec<CandidateTally>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateTally {
    pub candidate_id: i64,
    pub name: String,
    pub party: Option<String>,
    pub votes: i64,
    pub order: Option<i64>,
    pub elected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElectedCandidate {
    pub candidate_id: i64,
    pub name: String,
    pub party: Option<String>,
    pub pact_id: i64,
    pub pact_name: String,
    pub order: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElectedSummary {
    pub election: Election,
    pub unit: GeoUnit,
    pub elected: Vec<ElectedCandidate>,
}

#[derive(Debug, Default)]
struct CandidateAcc {
    votes: i64,
    pact_id: Option<i64>,
    order: Option<i64>,
    elected: bool,
}

/// Two-decimal percentage; an empty denominator yields `"0.00"`.
pub fn format_share(part: i64, whole: i64) -> String {
    if whole <= 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", part as f64 * 100.0 / whole as f64)
}

/// Sums the tables of one unit into pact and candidate totals.
///
/// Returns `None` when the unit has no stored tables.
pub fn summarize(
    election: Election,
    unit: GeoUnit,
    tables: &[TableResult],
    directory: &Directory,
) -> Option<SeatSummary> {
    if tables.is_empty() {
        return None;
    }

    let mut total_ballots = 0i64;
    let mut blank = 0i64;
    let mut null = 0i64;
    let mut tables_counted = 0usize;
    let mut tables_installed = 0usize;
    let mut per_candidate: HashMap<i64, CandidateAcc> = HashMap::new();

    for table in tables {
        total_ballots += table.total_emitidos;
        blank += table.blancos;
        null += table.nulos;
        if table.is_counted() {
            tables_counted += 1;
        }
        if table.is_installed() {
            tables_installed += 1;
        }
        for vote in &table.candidatos {
            let acc = per_candidate.entry(vote.id_candidato).or_default();
            acc.votes += vote.votos;
            acc.pact_id = acc.pact_id.or(vote.id_pacto);
            acc.order = acc.order.or(vote.orden_voto);
            acc.elected |= vote.electo != 0;
        }
    }

    let valid_votes = total_ballots - blank - null;

    let mut by_pact: HashMap<i64, Vec<CandidateTally>> = HashMap::new();
    for (candidate_id, acc) in per_candidate {
        by_pact
            .entry(acc.pact_id.unwrap_or(0))
            .or_default()
            .push(CandidateTally {
                candidate_id,
                name: directory.candidate_name(candidate_id),
                party: directory.candidate_party(candidate_id),
                votes: acc.votes,
                order: acc.order,
                elected: acc.elected,
            });
    }

    let mut pacts = by_pact
        .into_iter()
        .map(|(pact_id, mut candidates)| {
            candidates.sort_by(|a, b| {
                b.votes
                    .cmp(&a.votes)
                    .then_with(|| a.order.cmp(&b.order))
                    .then_with(|| a.candidate_id.cmp(&b.candidate_id))
            });
            let votes = candidates.iter().map(|c| c.votes).sum();
            PactTally {
                pact_id,
                name: directory.pact_name(pact_id),
                votes,
                share: format_share(votes, valid_votes),
                candidates,
            }
        })
        .collect::<Vec<_>>();
    pacts.sort_by(|a, b| b.votes.cmp(&a.votes).then_with(|| a.pact_id.cmp(&b.pact_id)));

    Some(SeatSummary {
        election,
        unit,
        tables_total: tables.len(),
        tables_counted,
        tables_installed,
        tables_counted_pct: format_share(tables_counted as i64, tables.len() as i64),
        total_ballots,
        blank,
        null,
        valid_votes,
        pacts,
    })
}

/// Candidates flagged elected in at least one table, ordered by ballot order.
pub fn elected(
    election: Election,
    unit: GeoUnit,
    tables: &[TableResult],
    directory: &Directory,
) -> Option<ElectedSummary> {
    if tables.is_empty() {
        return None;
    }

    let mut seen: HashMap<i64, ElectedCandidate> = HashMap::new();
    for vote in tables.iter().flat_map(|t| t.candidatos.iter()) {
        if vote.electo == 0 {
            continue;
        }
        let entry = seen.entry(vote.id_candidato).or_insert_with(|| {
            let pact_id = vote.id_pacto.unwrap_or(0);
            ElectedCandidate {
                candidate_id: vote.id_candidato,
                name: directory.candidate_name(vote.id_candidato),
                party: directory.candidate_party(vote.id_candidato),
                pact_id,
                pact_name: directory.pact_name(pact_id),
                order: vote.orden_voto,
            }
        });
        entry.order = entry.order.or(vote.orden_voto);
    }

    let mut elected = seen.into_values().collect::<Vec<_>>();
    elected.sort_by(|a, b| match (a.order, b.order) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.candidate_id.cmp(&b.candidate_id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.candidate_id.cmp(&b.candidate_id),
    });

    Some(ElectedSummary {
        election,
        unit,
        elected,
    })
}
