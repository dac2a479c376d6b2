use axum::{
    debug_handler,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use crate::{AppState, Markdown, Rooms, include_res};

#[derive(Deserialize)]
pub struct IndexQuery {
    pub error: Option<String>,
}

fn notice(error: Option<&str>) -> &'static str {
    match error {
        Some("room-not-found") => "> **That room does not exist.** It may have expired or been destroyed.",
        Some("room-full") => "> **That room is full.** Every seat has already been handed out.",
        _ => "",
    }
}

fn lifetime(secs: u64) -> String {
    let (n, unit) = match secs {
        s if s % 3600 == 0 => (s / 3600, "hour"),
        s if s % 60 == 0 => (s / 60, "minute"),
        s => (s, "second"),
    };

    if n == 1 { format!("1 {unit}") } else { format!("{n} {unit}s") }
}

#[debug_handler(state = AppState)]
pub async fn index(
    State(rooms): State<Rooms>,
    Query(IndexQuery { error }): Query<IndexQuery>,
) -> impl IntoResponse {
    let policy = rooms.policy();

    Markdown(
        include_res!(str, "/pages/index.md")
            .replace("{notice}", notice(error.as_deref()))
            .replace("{lifetime}", &lifetime(policy.room_ttl))
            .replace("{seats}", &policy.max_participants.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_errors_get_a_notice() {
        assert!(notice(Some("room-full")).contains("full"));
        assert!(notice(Some("room-not-found")).contains("does not exist"));
        assert_eq!(notice(Some("<script>")), "");
        assert_eq!(notice(None), "");
    }

    #[test]
    fn lifetime_reads_naturally() {
        assert_eq!(lifetime(600), "10 minutes");
        assert_eq!(lifetime(60), "1 minute");
        assert_eq!(lifetime(7200), "2 hours");
        assert_eq!(lifetime(90), "90 seconds");
    }
}
