//! Real-time event streaming via Server-Sent Events.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use scan_core::{JobEvent, JobId};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventParams {
    /// Only forward events of this job. Pool events are dropped too.
    pub job_id: Option<String>,
}

/// Render one event, named after its kind, with the JSON body as data.
pub fn to_sse_event(event: &JobEvent) -> Option<Event> {
    match Event::default().event(event.kind()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode event");
            None
        }
    }
}

/// GET /events
pub async fn events(
    State(state): State<AppState>,
    Query(params): Query<EventParams>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let only = params
        .job_id
        .as_deref()
        .map(JobId::parse)
        .transpose()
        .map_err(|e| AppError::BadRequest(format!("invalid job id: {e}")))?;

    let stream = BroadcastStream::new(state.service.subscribe()).filter_map(move |item| {
        match item {
            Ok(event) if only.is_none() || event.job_id() == only => {
                to_sse_event(&event).map(Ok)
            }
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event subscriber lagged");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
