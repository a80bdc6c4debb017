use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{Postgres, QueryBuilder};
use tracing::instrument;

use crate::database_ops::attribute::{AttributeKind, AttributeNames};
use crate::util::db::Db;

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 500;

/// Games with fewer reviews never pass a minimum-score filter.
pub const MIN_REVIEWS_FOR_SCORE: i64 = 10;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FilterError {
    #[error("invalid {field}: {value:?}")]
    Invalid { field: &'static str, value: String },
    #[error("unsupported sort key {0:?}")]
    Sort(String),
    #[error("unsupported sort direction {0:?}")]
    Direction(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Score,
    Title,
    ReleaseDate,
    Price,
    TotalReviews,
}

impl SortKey {
    fn parse(s: &str) -> Result<Self, FilterError> {
        match s {
            "score" => Ok(Self::Score),
            "title" => Ok(Self::Title),
            "release_date" => Ok(Self::ReleaseDate),
            "price" | "last_price" => Ok(Self::Price),
            "total_reviews" => Ok(Self::TotalReviews),
            other => Err(FilterError::Sort(other.to_string())),
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::Score => "score",
            Self::Title => "title",
            Self::ReleaseDate => "release_date",
            Self::Price => "last_price",
            Self::TotalReviews => "total_reviews",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    fn parse(s: &str) -> Result<Self, FilterError> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(FilterError::Direction(s.to_string())),
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Parsed `/search` query string.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchFilters {
    pub query: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
    /// Any-of match per kind, case-insensitive.
    pub attributes: AttributeNames,
    pub min_score: Option<f64>,
    pub sort: SortKey,
    pub direction: SortDirection,
    pub limit: i64,
    pub offset: i64,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            query: None,
            min_price: None,
            max_price: None,
            min_year: None,
            max_year: None,
            attributes: AttributeNames::default(),
            min_score: None,
            sort: SortKey::default(),
            direction: SortDirection::default(),
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

fn parse_num<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, FilterError> {
    value.trim().parse().map_err(|_| FilterError::Invalid {
        field,
        value: value.to_string(),
    })
}

impl SearchFilters {
    /// Parse a raw query string. List filters accept both `genres[]=a` and
    /// `genres=a`; empty values are ignored.
    pub fn from_query(qs: &str) -> Result<Self, FilterError> {
        let mut f = Self::default();
        for (key, value) in url::form_urlencoded::parse(qs.as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim_end_matches("[]") {
                "query" => f.query = Some(value.to_string()),
                "min_price" => f.min_price = Some(parse_num("min_price", value)?),
                "max_price" => f.max_price = Some(parse_num("max_price", value)?),
                "min_year" => f.min_year = Some(parse_num("min_year", value)?),
                "max_year" => f.max_year = Some(parse_num("max_year", value)?),
                "score" => f.min_score = Some(parse_num("score", value)?),
                "sort" => f.sort = SortKey::parse(value)?,
                "sort_direction" => f.direction = SortDirection::parse(value)?,
                "limit" => {
                    let n: i64 = parse_num("limit", value)?;
                    f.limit = n.clamp(1, MAX_LIMIT);
                }
                "offset" => f.offset = parse_num::<i64>("offset", value)?.max(0),
                "genres" => f.attributes.genres.push(value.to_string()),
                "tags" => f.attributes.tags.push(value.to_string()),
                "developers" => f.attributes.developers.push(value.to_string()),
                "publishers" => f.attributes.publishers.push(value.to_string()),
                _ => {}
            }
        }
        Ok(f)
    }
}

/// One game as served by the query API.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GameView {
    pub steam_id: i64,
    pub title: String,
    pub link: String,
    pub available: bool,
    pub release_date: Option<NaiveDate>,
    pub supports_win: bool,
    pub supports_linux: bool,
    pub supports_mac: bool,
    pub positive_reviews: Option<i64>,
    pub total_reviews: Option<i64>,
    /// positive / total * 100; NULL without reviews.
    pub score: Option<f64>,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    pub developers: Vec<String>,
    pub publishers: Vec<String>,
    /// Latest discounted price.
    pub last_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PriceObservation {
    pub price_wo_discount: f64,
    pub price_w_discount: f64,
    pub date_time: DateTime<Utc>,
}

fn select_games<'a>() -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(
        "SELECT * FROM (SELECT g.steam_id, g.title, g.link, g.available, g.release_date, \
         g.supports_win, g.supports_linux, g.supports_mac, g.positive_reviews, g.total_reviews, \
         CASE WHEN g.total_reviews > 0 \
              THEN g.positive_reviews::float8 / g.total_reviews * 100 END AS score",
    );
    for kind in AttributeKind::ALL {
        qb.push(format!(
            ", ARRAY(SELECT a.{name} FROM {link} l JOIN {table} a ON a.{id} = l.{id} \
             WHERE l.game_id = g.game_id ORDER BY a.{name}) AS {table}",
            name = kind.name_column(),
            link = kind.link_table(),
            table = kind.table(),
            id = kind.id_column(),
        ));
    }
    qb.push(
        ", ph.price_w_discount::float8 AS last_price, g.game_id \
         FROM games g \
         LEFT JOIN LATERAL (SELECT p.price_w_discount FROM price_history p \
             WHERE p.game_id = g.game_id ORDER BY p.date_time DESC LIMIT 1) ph ON TRUE",
    );
    qb
}

fn push_and(qb: &mut QueryBuilder<'_, Postgres>, first: &mut bool) {
    qb.push(if *first { " WHERE " } else { " AND " });
    *first = false;
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Build the search statement. The inner select exposes `score` and
/// `last_price` as plain columns so the outer query can filter and sort on them.
pub fn build_search(f: &SearchFilters) -> QueryBuilder<'static, Postgres> {
    let mut qb = select_games();
    let mut first = true;

    if let Some(q) = &f.query {
        push_and(&mut qb, &mut first);
        qb.push("g.title ILIKE ")
            .push_bind(format!("%{}%", escape_like(q)));
    }
    if let Some(y) = f.min_year {
        push_and(&mut qb, &mut first);
        qb.push("EXTRACT(YEAR FROM g.release_date) >= ").push_bind(y);
    }
    if let Some(y) = f.max_year {
        push_and(&mut qb, &mut first);
        qb.push("EXTRACT(YEAR FROM g.release_date) <= ").push_bind(y);
    }
    for kind in AttributeKind::ALL {
        let names = f.attributes.get(kind);
        if names.is_empty() {
            continue;
        }
        let lowered: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        push_and(&mut qb, &mut first);
        qb.push(format!(
            "g.game_id IN (SELECT l.game_id FROM {link} l JOIN {table} a ON a.{id} = l.{id} \
             WHERE lower(a.{name}) = ANY(",
            link = kind.link_table(),
            table = kind.table(),
            id = kind.id_column(),
            name = kind.name_column(),
        ))
        .push_bind(lowered)
        .push("))");
    }
    qb.push(") s");

    // Filters on derived columns.
    let mut first = true;
    if let Some(p) = f.min_price {
        push_and(&mut qb, &mut first);
        qb.push("s.last_price >= ").push_bind(p);
    }
    if let Some(p) = f.max_price {
        push_and(&mut qb, &mut first);
        qb.push("s.last_price <= ").push_bind(p);
    }
    if let Some(score) = f.min_score {
        push_and(&mut qb, &mut first);
        qb.push(format!("s.total_reviews > {MIN_REVIEWS_FOR_SCORE} AND s.score >= "))
            .push_bind(score);
    }

    qb.push(format!(
        " ORDER BY s.{} {} NULLS LAST, s.steam_id ASC LIMIT ",
        f.sort.column(),
        f.direction.sql()
    ))
    .push_bind(f.limit)
    .push(" OFFSET ")
    .push_bind(f.offset);
    qb
}

#[instrument(skip(db))]
pub async fn search_games(db: &Db, filters: &SearchFilters) -> Result<Vec<GameView>> {
    let mut qb = build_search(filters);
    let rows = qb
        .build_query_as::<GameView>()
        .fetch_all(&db.pool)
        .await?;
    Ok(rows)
}

#[instrument(skip(db))]
pub async fn get_game(db: &Db, steam_id: i64) -> Result<Option<GameView>> {
    let mut qb = select_games();
    qb.push(" WHERE g.steam_id = ").push_bind(steam_id).push(") s");
    let row = qb
        .build_query_as::<GameView>()
        .fetch_optional(&db.pool)
        .await?;
    Ok(row)
}

/// Chronological price history; `None` when the game is unknown.
#[instrument(skip(db))]
pub async fn get_prices(db: &Db, steam_id: i64) -> Result<Option<Vec<PriceObservation>>> {
    let game_id: Option<i64> = sqlx::query_scalar("SELECT game_id FROM games WHERE steam_id = $1")
        .bind(steam_id)
        .fetch_optional(&db.pool)
        .await?;
    let Some(game_id) = game_id else {
        return Ok(None);
    };
    let rows = sqlx::query_as::<_, PriceObservation>(
        "SELECT price_wo_discount::float8 AS price_wo_discount, \
                price_w_discount::float8 AS price_w_discount, date_time \
         FROM price_history WHERE game_id = $1 ORDER BY date_time",
    )
    .bind(game_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(Some(rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_query_string() {
        let f = SearchFilters::from_query(
            "query=portal&min_price=1.5&max_year=2020&genres[]=Action&genres[]=RPG\
             &tags=Co-op&score=80&sort=price&sort_direction=ASC&limit=20&offset=40",
        )
        .unwrap();
        assert_eq!(f.query.as_deref(), Some("portal"));
        assert_eq!(f.min_price, Some(1.5));
        assert_eq!(f.max_year, Some(2020));
        assert_eq!(f.attributes.genres, vec!["Action", "RPG"]);
        assert_eq!(f.attributes.tags, vec!["Co-op"]);
        assert_eq!(f.min_score, Some(80.0));
        assert_eq!(f.sort, SortKey::Price);
        assert_eq!(f.direction, SortDirection::Asc);
        assert_eq!((f.limit, f.offset), (20, 40));
    }

    #[test]
    fn defaults_and_limit_clamp() {
        let f = SearchFilters::from_query("").unwrap();
        assert_eq!(f, SearchFilters::default());
        assert_eq!(f.sort, SortKey::Score);
        assert_eq!(f.direction, SortDirection::Desc);
        assert_eq!(SearchFilters::from_query("limit=9999").unwrap().limit, MAX_LIMIT);
        assert_eq!(SearchFilters::from_query("limit=0").unwrap().limit, 1);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            SearchFilters::from_query("sort=game_id; DROP TABLE games").unwrap_err(),
            FilterError::Sort("game_id; DROP TABLE games".into())
        );
        assert!(matches!(
            SearchFilters::from_query("min_year=soon"),
            Err(FilterError::Invalid { field: "min_year", .. })
        ));
        assert!(SearchFilters::from_query("sort_direction=sideways").is_err());
    }

    #[test]
    fn search_sql_binds_filters_and_sorts_nulls_last() {
        let f = SearchFilters::from_query("query=50%&developers[]=Valve&score=90&sort=score").unwrap();
        let qb = build_search(&f);
        let sql = qb.sql();
        assert!(sql.contains("g.title ILIKE $1"));
        assert!(sql.contains("game_developers l JOIN developers a"));
        assert!(sql.contains("lower(a.developer_name) = ANY($2)"));
        assert!(sql.contains("s.total_reviews > 10 AND s.score >= $3"));
        assert!(sql.contains("ORDER BY s.score DESC NULLS LAST"));
        assert!(sql.contains("LIMIT $4 OFFSET $5"));
        assert!(sql.contains("CASE WHEN g.total_reviews > 0"));
    }

    #[test]
    fn unfiltered_search_has_no_where() {
        let sql = build_search(&SearchFilters::default()).sql().to_string();
        assert!(!sql.contains(" WHERE g."));
        assert!(!sql.contains(" WHERE s."));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
    }
}
