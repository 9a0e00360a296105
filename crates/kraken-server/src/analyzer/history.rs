// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Test result history: change, age and instability of every result.

use kraken_core::model::{FlowKind, ResultChange, TcResult};
use kraken_core::persistence::{FlowRecord, HistoryCounters, HistoryQuery, JobRecord};
use tracing::debug;

use crate::context::ServerContext;
use crate::error::Result;

/// Prior results considered for a CI result.
pub const HISTORY_LIMIT: i64 = 10;

/// Outcome of comparing one result with its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub change: ResultChange,
    pub age: i32,
    pub instability: i32,
    /// Same result as the reference one.
    pub unchanged: bool,
}

impl Verdict {
    fn tally(&self, counters: &mut HistoryCounters) {
        match self.change {
            ResultChange::New => counters.new_cnt += 1,
            ResultChange::Fix => counters.fix_cnt += 1,
            ResultChange::Regression => counters.regr_cnt += 1,
            ResultChange::No if self.unchanged => counters.no_change_cnt += 1,
            ResultChange::No => {}
        }
    }
}

fn change_between(reference: TcResult, current: TcResult) -> ResultChange {
    match (reference == TcResult::Passed, current == TcResult::Passed) {
        (false, true) => ResultChange::Fix,
        (true, false) => ResultChange::Regression,
        _ => ResultChange::No,
    }
}

/// Classify a CI result against its prior `(result, age)` history, oldest first.
pub fn classify_ci(history: &[(TcResult, i32)], current: TcResult) -> Verdict {
    let flips = history.windows(2).filter(|w| w[0].0 != w[1].0).count() as i32;
    let Some(&(last, last_age)) = history.last() else {
        return Verdict {
            change: ResultChange::New,
            age: 0,
            instability: 0,
            unchanged: false,
        };
    };
    if last == current {
        Verdict {
            change: ResultChange::No,
            age: last_age + 1,
            instability: flips,
            unchanged: true,
        }
    } else {
        Verdict {
            change: change_between(last, current),
            age: 0,
            instability: flips + 1,
            unchanged: false,
        }
    }
}

/// Classify a DEV result against the latest CI result of the same test.
pub fn classify_dev(reference: Option<TcResult>, current: TcResult) -> Verdict {
    match reference {
        None => Verdict {
            change: ResultChange::New,
            age: 0,
            instability: 0,
            unchanged: false,
        },
        Some(reference) => Verdict {
            change: change_between(reference, current),
            age: 0,
            instability: 0,
            unchanged: reference == current,
        },
    }
}

/// Analyze every result of a job and return the counters it contributes.
pub async fn analyze_job_results(
    ctx: &ServerContext,
    job: &JobRecord,
    flow: &FlowRecord,
) -> Result<HistoryCounters> {
    let mut counters = HistoryCounters::default();
    for result in ctx.persistence.list_job_results(job.id).await? {
        let query = HistoryQuery {
            test_case_id: result.test_case_id,
            branch_id: flow.branch_id,
            agents_group_id: job.agents_group_id,
            system_id: job.system_id,
            flow_created_before: flow.created,
            exclude_result_id: result.id,
            limit: HISTORY_LIMIT,
        };
        let verdict = match flow.kind {
            FlowKind::Ci => {
                let history: Vec<(TcResult, i32)> = ctx
                    .persistence
                    .result_history(&query)
                    .await?
                    .into_iter()
                    .map(|r| (r.result, r.age))
                    .collect();
                classify_ci(&history, result.result)
            }
            FlowKind::Dev => {
                let reference = ctx.persistence.latest_ci_result(&query).await?;
                classify_dev(reference.map(|r| r.result), result.result)
            }
        };
        let comment = ctx
            .persistence
            .latest_comment(result.test_case_id, flow.branch_id)
            .await?;
        ctx.persistence
            .update_result_analysis(
                result.id,
                verdict.change,
                verdict.age,
                verdict.instability,
                comment.map(|c| c.id),
            )
            .await?;
        verdict.tally(&mut counters);
    }
    debug!(job_id = job.id, ?counters, "Job results analyzed");
    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use TcResult::{Failed, NotRun, Passed};

    #[test]
    fn test_first_result_is_new() {
        let v = classify_ci(&[], Passed);
        assert_eq!(v.change, ResultChange::New);
        assert_eq!(v.age, 0);
    }

    #[test]
    fn test_pass_fail_pass_is_a_fix() {
        let v = classify_ci(&[(Passed, 0), (Failed, 0)], Passed);
        assert_eq!(v.change, ResultChange::Fix);
        assert_eq!(v.age, 0);
        assert_eq!(v.instability, 2);

        // flips already in history count even when the result holds
        let v = classify_ci(&[(Passed, 0), (Failed, 0), (Failed, 1)], Failed);
        assert_eq!(v.change, ResultChange::No);
        assert_eq!(v.age, 2);
        assert_eq!(v.instability, 1);
    }

    #[test]
    fn test_stable_result_ages() {
        let v = classify_ci(&[(Passed, 3), (Passed, 4)], Passed);
        assert_eq!(v.change, ResultChange::No);
        assert_eq!(v.age, 5);
        assert_eq!(v.instability, 0);
        assert!(v.unchanged);
    }

    #[test]
    fn test_regression_and_non_pass_flip() {
        let v = classify_ci(&[(Passed, 2)], Failed);
        assert_eq!(v.change, ResultChange::Regression);
        assert_eq!(v.instability, 1);

        let v = classify_ci(&[(Failed, 2)], NotRun);
        assert_eq!(v.change, ResultChange::No);
        assert!(!v.unchanged);
        let mut counters = HistoryCounters::default();
        v.tally(&mut counters);
        assert_eq!(counters, HistoryCounters::default());
    }

    #[test]
    fn test_dev_compares_with_ci_reference() {
        assert_eq!(classify_dev(None, Passed).change, ResultChange::New);
        assert_eq!(classify_dev(Some(Failed), Passed).change, ResultChange::Fix);
        let same = classify_dev(Some(Passed), Passed);
        assert_eq!(same.change, ResultChange::No);
        assert!(same.unchanged);
    }

    #[test]
    fn test_tally() {
        let mut counters = HistoryCounters::default();
        classify_ci(&[], Passed).tally(&mut counters);
        classify_ci(&[(Passed, 0)], Failed).tally(&mut counters);
        classify_ci(&[(Failed, 0)], Passed).tally(&mut counters);
        classify_ci(&[(Passed, 0)], Passed).tally(&mut counters);
        assert_eq!(
            counters,
            HistoryCounters {
                new_cnt: 1,
                no_change_cnt: 1,
                regr_cnt: 1,
                fix_cnt: 1,
                issues_new: 0
            }
        );
    }
}
