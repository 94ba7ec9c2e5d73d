//! POST: JSON statements forwarded to the query executor.

use super::{HttpService, Request, Response};
use crate::services::query::{QueryError, Statement};
use tracing::{debug, warn};

pub(super) fn serve(service: &HttpService, request: &Request) -> Response {
    let is_json = request
        .header("Content-Type")
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("application/json"));
    if !is_json {
        return Response::error(415);
    }

    let statement = match Statement::from_json(&request.body) {
        Ok(statement) => statement,
        Err(e) => {
            debug!(error = %e, "Rejected statement");
            return Response::error(400);
        }
    };

    let Some(executor) = &service.query else {
        return Response::error(503);
    };

    match executor.execute(&statement) {
        Ok(result) => Response::new(200)
            .header("Content-Type", "application/json")
            .body(result),
        Err(QueryError::Malformed(e)) => {
            debug!(error = %e, "Rejected statement");
            Response::error(400)
        }
        Err(QueryError::Unavailable) => Response::error(503),
        Err(e @ QueryError::Failed(_)) => {
            warn!(error = %e, "Query failed");
            Response::error(500)
        }
    }
}
