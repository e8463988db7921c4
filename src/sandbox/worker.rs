//! Entry point for the isolated child process.

use std::io::{Read, Write};

use super::{WorkerRequest, WorkerResponse};

/// Blocking worker body: one request on stdin, one JSON outcome on stdout.
/// Never panics outward; any failure becomes a structured error response.
pub fn run_worker() -> i32 {
    let mut input = String::new();
    if std::io::stdin().read_to_string(&mut input).is_err() {
        emit(WorkerResponse::Err {
            kind: "io".into(),
            message: "failed to read request from stdin".into(),
        });
        return 1;
    }

    let request: WorkerRequest = match serde_json::from_str(&input) {
        Ok(request) => request,
        Err(err) => {
            emit(WorkerResponse::Err {
                kind: "io".into(),
                message: format!("bad request payload: {err}"),
            });
            return 1;
        }
    };

    let response = match qwed_engines::stats::run(&request.code, &request.csv, request.budget) {
        Ok(value) => WorkerResponse::Ok {
            value: serde_json::json!(value),
        },
        Err(err) => WorkerResponse::Err {
            kind: error_kind(&err).into(),
            message: err.to_string(),
        },
    };
    emit(response);
    0
}

fn error_kind(err: &qwed_engines::stats::StatsError) -> &'static str {
    use qwed_engines::stats::StatsError;
    match err {
        StatsError::Grammar(_) => "grammar",
        StatsError::Budget => "budget",
        StatsError::Csv(_) => "csv",
        StatsError::UnknownColumn(_) | StatsError::NotNumeric(_) | StatsError::EmptyResult => {
            "data"
        }
    }
}

fn emit(response: WorkerResponse) {
    if let Ok(rendered) = serde_json::to_string(&response) {
        let _ = std::io::stdout().write_all(rendered.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        use qwed_engines::stats::StatsError;
        assert_eq!(error_kind(&StatsError::Grammar("x".into())), "grammar");
        assert_eq!(error_kind(&StatsError::Budget), "budget");
        assert_eq!(error_kind(&StatsError::UnknownColumn("c".into())), "data");
    }
}
