//! Multi-engine consensus aggregation.
//!
//! Engines run concurrently under one shared deadline. Votes are keyed by
//! verdict plus the engine's principal answer so "VERIFIED with 30.0" and
//! "VERIFIED with 31.0" disagree. Engine errors are dropped from the vote,
//! never counted as agreement.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinSet;
use tracing::debug;

use crate::dispatch::EngineOutcome;
use crate::model::{canonical_json, ConsensusMode, Verdict};
use crate::reflection::BoxFut;

#[derive(Debug, Clone)]
pub struct EngineVote {
    pub engine: String,
    pub outcome: Result<EngineOutcome, String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ConsensusReport {
    pub verdict: Verdict,
    pub confidence: f64,
    pub agreement: &'static str,
    pub detail: serde_json::Value,
}

/// Run the named engines concurrently and aggregate per the mode rules.
pub async fn run_consensus(
    mode: ConsensusMode,
    engines: Vec<(String, BoxFut<Result<EngineOutcome, String>>)>,
    deadline: Duration,
) -> ConsensusReport {
    let mut set = JoinSet::new();
    for (name, future) in engines {
        set.spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(deadline, future).await {
                Ok(result) => result,
                Err(_) => Err("engine deadline exceeded".to_string()),
            };
            EngineVote {
                engine: name,
                outcome,
                latency_ms: started.elapsed().as_millis() as u64,
            }
        });
    }

    let mut votes = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(vote) => votes.push(vote),
            Err(err) => debug!(%err, "consensus engine task aborted"),
        }
    }
    votes.sort_by(|a, b| a.engine.cmp(&b.engine));

    aggregate(mode, votes)
}

fn aggregate(mode: ConsensusMode, votes: Vec<EngineVote>) -> ConsensusReport {
    let breakdown: Vec<serde_json::Value> = votes
        .iter()
        .map(|vote| match &vote.outcome {
            Ok(outcome) => json!({
                "engine": vote.engine,
                "verdict": outcome.verdict.as_str(),
                "detail": outcome.detail,
                "latency_ms": vote.latency_ms,
            }),
            Err(error) => json!({
                "engine": vote.engine,
                "verdict": Verdict::Error.as_str(),
                "error": error,
                "latency_ms": vote.latency_ms,
            }),
        })
        .collect();

    // Errors do not vote.
    let valid: Vec<(&EngineVote, &EngineOutcome)> = votes
        .iter()
        .filter_map(|vote| vote.outcome.as_ref().ok().map(|o| (vote, o)))
        .collect();

    if valid.is_empty() {
        return ConsensusReport {
            verdict: Verdict::Error,
            confidence: 0.0,
            agreement: "no_valid_engines",
            detail: json!({"engines": breakdown}),
        };
    }

    match mode {
        ConsensusMode::Single => {
            let (_, outcome) = valid[0];
            ConsensusReport {
                verdict: outcome.verdict,
                confidence: outcome.confidence,
                agreement: "single",
                detail: json!({
                    "engines": breakdown,
                    "answer": outcome.detail,
                }),
            }
        }
        ConsensusMode::High => {
            if valid.len() < 2 {
                let (_, outcome) = valid[0];
                return ConsensusReport {
                    verdict: outcome.verdict,
                    confidence: outcome.confidence * 0.8,
                    agreement: "degraded_single",
                    detail: json!({"engines": breakdown}),
                };
            }
            let agreed = vote_key(valid[0].1) == vote_key(valid[1].1);
            if agreed {
                ConsensusReport {
                    verdict: valid[0].1.verdict,
                    confidence: 0.95,
                    agreement: "unanimous",
                    detail: json!({
                        "engines": breakdown,
                        "answer": valid[0].1.detail,
                    }),
                }
            } else {
                ConsensusReport {
                    verdict: Verdict::Disputed,
                    confidence: 0.55,
                    agreement: "split",
                    detail: json!({"engines": breakdown}),
                }
            }
        }
        ConsensusMode::Maximum => {
            let mut tally: HashMap<String, usize> = HashMap::new();
            for (_, outcome) in &valid {
                *tally.entry(vote_key(outcome)).or_insert(0) += 1;
            }
            let (winning_key, winning_count) = tally
                .iter()
                .max_by_key(|(_, count)| **count)
                .map(|(k, c)| (k.clone(), *c))
                .expect("non-empty tally");
            let share = winning_count as f64 / valid.len() as f64;
            let winner = valid
                .iter()
                .find(|(_, o)| vote_key(o) == winning_key)
                .map(|(_, o)| *o)
                .expect("winner present");

            if winning_count * 2 > valid.len() {
                ConsensusReport {
                    verdict: winner.verdict,
                    confidence: 0.90,
                    agreement: if winning_count == valid.len() {
                        "unanimous"
                    } else {
                        "majority"
                    },
                    detail: json!({
                        "engines": breakdown,
                        "answer": winner.detail,
                        "share": share,
                    }),
                }
            } else {
                ConsensusReport {
                    verdict: Verdict::Disputed,
                    confidence: share,
                    agreement: "no_consensus",
                    detail: json!({"engines": breakdown, "share": share}),
                }
            }
        }
    }
}

/// Two engines agree when verdict and principal answer both match.
fn vote_key(outcome: &EngineOutcome) -> String {
    let answer = outcome
        .detail
        .get("calculated_value")
        .or_else(|| outcome.detail.get("result"))
        .or_else(|| outcome.detail.get("model"))
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    format!("{}|{}", outcome.verdict.as_str(), canonical_json(&answer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(
        name: &str,
        verdict: Verdict,
        answer: f64,
    ) -> (String, BoxFut<Result<EngineOutcome, String>>) {
        let outcome = EngineOutcome {
            verdict,
            detail: json!({"calculated_value": answer}),
            confidence: 1.0,
        };
        (name.to_string(), Box::pin(async move { Ok(outcome) }))
    }

    fn failing(name: &str) -> (String, BoxFut<Result<EngineOutcome, String>>) {
        (
            name.to_string(),
            Box::pin(async { Err("engine crashed".to_string()) }),
        )
    }

    #[tokio::test]
    async fn high_mode_agreement_is_095() {
        let report = run_consensus(
            ConsensusMode::High,
            vec![
                engine("math", Verdict::Verified, 30.0),
                engine("stats", Verdict::Verified, 30.0),
            ],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(report.verdict, Verdict::Verified);
        assert!((report.confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(report.agreement, "unanimous");
    }

    #[tokio::test]
    async fn high_mode_disagreement_is_disputed_055() {
        let report = run_consensus(
            ConsensusMode::High,
            vec![
                engine("math", Verdict::Verified, 30.0),
                engine("stats", Verdict::Verified, 31.0),
            ],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(report.verdict, Verdict::Disputed);
        assert!((report.confidence - 0.55).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn maximum_mode_majority_is_090() {
        let report = run_consensus(
            ConsensusMode::Maximum,
            vec![
                engine("a", Verdict::Verified, 42.0),
                engine("b", Verdict::Verified, 42.0),
                engine("c", Verdict::Corrected, 41.0),
            ],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(report.verdict, Verdict::Verified);
        assert!((report.confidence - 0.90).abs() < f64::EPSILON);
        assert_eq!(report.agreement, "majority");
    }

    #[tokio::test]
    async fn maximum_mode_no_majority_uses_plurality_share() {
        let report = run_consensus(
            ConsensusMode::Maximum,
            vec![
                engine("a", Verdict::Verified, 1.0),
                engine("b", Verdict::Verified, 2.0),
                engine("c", Verdict::Corrected, 3.0),
                engine("d", Verdict::Corrected, 4.0),
            ],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(report.verdict, Verdict::Disputed);
        assert!((report.confidence - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn errors_are_dropped_from_the_vote() {
        let report = run_consensus(
            ConsensusMode::High,
            vec![engine("math", Verdict::Verified, 7.0), failing("code")],
            Duration::from_secs(5),
        )
        .await;
        // One valid engine left: degraded single, not a dispute.
        assert_eq!(report.verdict, Verdict::Verified);
        assert_eq!(report.agreement, "degraded_single");
        let engines = report.detail["engines"].as_array().unwrap();
        assert_eq!(engines.len(), 2);
    }

    #[tokio::test]
    async fn deadline_turns_slow_engines_into_errors() {
        let slow: (String, BoxFut<Result<EngineOutcome, String>>) = (
            "slow".to_string(),
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err("unreachable".to_string())
            }),
        );
        let report = run_consensus(
            ConsensusMode::High,
            vec![engine("fast", Verdict::Verified, 1.0), slow],
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(report.agreement, "degraded_single");
    }
}
