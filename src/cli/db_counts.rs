use anyhow::Result;
use std::fmt::Write as _;

use crate::util::db::Db;
use crate::util::env as env_util;

/// Connect, count every catalog table and render a two-column report.
pub async fn run(database_url: Option<String>) -> Result<String> {
    env_util::init_env();
    let db_url = match database_url {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    let db = Db::connect(&db_url, 2).await?;
    let counts = db.table_counts().await?;
    Ok(render(&counts))
}

fn render(counts: &[(&str, i64)]) -> String {
    let width = counts.iter().map(|(t, _)| t.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (table, n) in counts {
        let _ = writeln!(out, "{table:<width$}  {n:>10}");
    }
    out
}
