//! `memoria sessions`: conversations active in a recent window.

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::config::MemoriaConfig;
use crate::memory::store::SessionActivity;
use crate::services::MemoryServices;

pub async fn sessions(config: MemoriaConfig, hours: u64) -> Result<()> {
    let services = MemoryServices::open(config)?;
    let since = Utc::now() - Duration::hours(hours.min(24 * 365 * 10) as i64);
    let sessions = services.store.list_sessions(Some(since), None).await?;

    if sessions.is_empty() {
        println!("No sessions with activity in the last {hours}h.");
        return Ok(());
    }
    print!("{}", render(&sessions, hours));
    Ok(())
}

fn render(sessions: &[SessionActivity], hours: u64) -> String {
    let width = sessions
        .iter()
        .map(|s| s.session_id.chars().count())
        .max()
        .unwrap_or(0)
        .max("SESSION".len());
    let mut out = format!("Sessions active in the last {hours}h: {}\n\n", sessions.len());
    out.push_str(&format!("{:<width$}  {:>7}  LAST ACTIVITY\n", "SESSION", "EVENTS"));
    for s in sessions {
        out.push_str(&format!(
            "{:<width$}  {:>7}  {}\n",
            s.session_id, s.events, s.last_activity
        ));
    }
    out
}
