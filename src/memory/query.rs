//! Semantic query builder.
//!
//! Turns structured history parameters plus an optional natural-language intent
//! ("errores de ayer", "last 24h diagnostics") into an [`EventQuery`] for the event
//! store and, when useful, a [`VectorFilter`] for the vector index. Also renders
//! both into SQLite `WHERE` clauses with bound parameters.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::error::QueryError;
use crate::memory::parse_timestamp;
use crate::memory::types::EventType;

/// Default page size when the caller gives no limit.
pub const DEFAULT_LIMIT: usize = 20;
/// Hard cap on page size.
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Structured predicate over memory events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive substring of `texto_semantico`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    /// Match if `texto_semantico` contains any of these terms.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub any_terms: Vec<String>,
    /// Require `length(texto_semantico) > n`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_text_len: Option<usize>,
    /// Explicit opt-in for queries that are not restricted to one session.
    pub cross_partition: bool,
}

impl EventFilter {
    /// Single-partition filter for one conversation.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Cross-partition filter for global analytics.
    pub fn global() -> Self {
        Self {
            cross_partition: true,
            ..Self::default()
        }
    }

    /// Whether the filter is allowed to run: either scoped to a session or
    /// explicitly flagged as cross-partition.
    pub fn is_partition_safe(&self) -> bool {
        self.session_id.is_some() || self.cross_partition
    }
}

/// A store-ready query: filter, ordering on `ts_epoch`, and page size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventQuery {
    pub filter: EventFilter,
    pub order: SortOrder,
    pub limit: usize,
    /// Rows skipped before the page starts.
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl EventQuery {
    pub fn new(filter: EventFilter) -> Self {
        Self {
            filter,
            order: SortOrder::Desc,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, MAX_LIMIT);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Structured filter for vector index queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VectorFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tipo: Option<EventType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exito: Option<bool>,
}

impl VectorFilter {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }
}

/// Raw history parameters, as received from a query string or JSON body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryParams {
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub endpoint: Option<String>,
    pub event_type: Option<String>,
    pub contains: Option<String>,
    pub success: Option<bool>,
    pub date_start: Option<String>,
    pub date_end: Option<String>,
    pub order: Option<String>,
    pub limit: Option<usize>,
    /// Natural-language intent, e.g. "errores de ayer".
    pub intent: Option<String>,
}

impl HistoryParams {
    /// Read parameters from a loosely-typed map. Numbers and booleans may arrive as
    /// strings (query strings) or as JSON scalars (bodies).
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let text = |keys: &[&str]| -> Option<String> {
            keys.iter().find_map(|k| match fields.get(*k) {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
        };
        let flag = |key: &str| -> Option<bool> {
            match fields.get(key)? {
                Value::Bool(b) => Some(*b),
                Value::String(s) => match s.to_lowercase().as_str() {
                    "true" | "1" | "si" | "sí" | "yes" => Some(true),
                    "false" | "0" | "no" => Some(false),
                    _ => None,
                },
                _ => None,
            }
        };
        let number = |key: &str| -> Option<usize> {
            match fields.get(key)? {
                Value::Number(n) => n.as_u64().map(|n| n as usize),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
        };

        Self {
            session_id: text(&["session_id"]),
            agent_id: text(&["agent_id"]),
            endpoint: text(&["endpoint"]),
            event_type: text(&["event_type", "tipo"]),
            contains: text(&["contains", "contiene"]),
            success: flag("success").or_else(|| flag("exito")),
            date_start: text(&["date_start", "fecha_inicio"]),
            date_end: text(&["date_end", "fecha_fin"]),
            order: text(&["order", "orden"]),
            limit: number("limit").or_else(|| number("limite")),
            intent: text(&["intent", "query", "consulta", "q"]),
        }
    }
}

/// What the intent parser recognised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentHints {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub endpoint: Option<String>,
    pub event_type: Option<EventType>,
    /// Human-readable notes on each mapping applied.
    pub applied: Vec<String>,
}

/// Output of [`build_query`].
#[derive(Debug, Clone, Serialize)]
pub struct BuiltQuery {
    pub query: EventQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_filter: Option<VectorFilter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub intent_applied: Vec<String>,
    /// Rendered `WHERE ... ORDER BY ... LIMIT` for diagnostics.
    pub sql: String,
}

fn relative_window_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:last|past|[uú]ltim[oa]s?)\s+(\d{1,4})\s*(minutos?|minutes?|mins?|horas?|hours?|hrs?|h|d[ií]as?|days?|d|semanas?|weeks?)\b",
        )
        .ok()
    })
    .as_ref()
}

const ENDPOINT_KEYWORDS: &[(&[&str], &str)] = &[
    (&["diagnostico", "diagnóstico", "diagnostic", "diagnostics"], "diagnostico-recursos"),
    (&["archivo", "archivos", "file", "files", "leer"], "leer-archivo"),
    (&["script", "scripts"], "ejecutar-script"),
    (&["cli", "comando", "comandos", "command"], "ejecutar-cli"),
    (&["guardado", "guardada", "guardar"], "guardar-memoria"),
];

const EVENT_TYPE_KEYWORDS: &[(&[&str], EventType)] = &[
    (&["error", "errores", "fallo", "fallos", "falló", "failed", "failure", "failures"], EventType::Error),
    (&["pregunta", "preguntas", "pregunté", "dije", "asked"], EventType::UserInput),
    (&["nota", "notas", "snapshot", "snapshots"], EventType::Snapshot),
    (&["respuesta", "respuestas", "answer", "answers"], EventType::AssistantOutput),
];

/// Map date phrases and domain keywords in `text` to filter hints.
pub fn parse_intent(text: &str, now: DateTime<Utc>) -> IntentHints {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let has = |word: &str| tokens.iter().any(|t| *t == word);
    let start_of_today = now.date_naive().and_time(NaiveTime::MIN).and_utc();

    let mut hints = IntentHints::default();

    if let Some(caps) = relative_window_re().and_then(|re| re.captures(&lower)) {
        let amount: i64 = caps[1].parse().unwrap_or(0);
        let unit = &caps[2];
        let span = if unit.starts_with('m') {
            Duration::minutes(amount)
        } else if unit.starts_with('h') {
            Duration::hours(amount)
        } else if unit.starts_with('s') || unit.starts_with('w') {
            Duration::weeks(amount)
        } else {
            Duration::days(amount)
        };
        hints.since = Some(now - span);
        hints.applied.push(format!("ventana relativa: {}", &caps[0]));
    } else if has("ayer") || has("yesterday") {
        hints.since = Some(start_of_today - Duration::days(1));
        hints.until = Some(start_of_today - Duration::seconds(1));
        hints.applied.push("ventana: ayer".into());
    } else if has("hoy") || has("today") {
        hints.since = Some(start_of_today);
        hints.applied.push("ventana: hoy".into());
    } else if lower.contains("semana pasada")
        || lower.contains("última semana")
        || lower.contains("ultima semana")
        || lower.contains("last week")
    {
        hints.since = Some(now - Duration::days(7));
        hints.applied.push("ventana: última semana".into());
    } else if lower.contains("último mes") || lower.contains("ultimo mes") || lower.contains("last month")
    {
        hints.since = Some(now - Duration::days(30));
        hints.applied.push("ventana: último mes".into());
    }

    if let Some((_, endpoint)) = ENDPOINT_KEYWORDS
        .iter()
        .find(|(words, _)| words.iter().any(|w| has(w)))
    {
        hints.endpoint = Some((*endpoint).to_string());
        hints.applied.push(format!("endpoint: {endpoint}"));
    }

    if let Some((_, event_type)) = EVENT_TYPE_KEYWORDS
        .iter()
        .find(|(words, _)| words.iter().any(|w| has(w)))
    {
        hints.event_type = Some(*event_type);
        hints.applied.push(format!("event_type: {event_type}"));
    }

    hints
}

fn parse_bound(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, QueryError> {
    let parsed = parse_timestamp(raw).ok_or_else(|| QueryError::Date(raw.to_string()))?;
    let bare_date = raw.trim().len() == 10;
    if end_of_day && bare_date {
        Ok(parsed + Duration::days(1) - Duration::seconds(1))
    } else {
        Ok(parsed)
    }
}

/// Build a store query from explicit parameters plus intent hints.
///
/// Explicit parameters always win over hints. A query without `session_id` is
/// marked cross-partition. `limit` defaults to `default_limit` and is capped at
/// `max_limit` (itself never above [`MAX_LIMIT`]).
pub fn build_query(
    params: &HistoryParams,
    now: DateTime<Utc>,
    default_limit: usize,
    max_limit: usize,
) -> Result<BuiltQuery, QueryError> {
    let hints = params
        .intent
        .as_deref()
        .map(|text| parse_intent(text, now))
        .unwrap_or_default();

    let event_type = match params.event_type.as_deref() {
        Some(raw) => Some(
            raw.parse::<EventType>()
                .map_err(|_| QueryError::EventType(raw.to_string()))?,
        ),
        None => hints.event_type,
    };

    let order = match params.order.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => return Err(QueryError::Order(other.to_string())),
    };

    let since = match params.date_start.as_deref() {
        Some(raw) => Some(parse_bound(raw, false)?),
        None => hints.since,
    };
    let until = match params.date_end.as_deref() {
        Some(raw) => Some(parse_bound(raw, true)?),
        None => hints.until,
    };
    if let (Some(s), Some(u)) = (since, until) {
        if s > u {
            return Err(QueryError::EmptyWindow);
        }
    }

    let filter = EventFilter {
        session_id: params.session_id.clone(),
        agent_id: params.agent_id.clone(),
        endpoint: params.endpoint.clone().or(hints.endpoint),
        event_type,
        success: params.success,
        since,
        until,
        contains: params.contains.clone(),
        any_terms: Vec::new(),
        min_text_len: None,
        cross_partition: params.session_id.is_none(),
    };

    let max_limit = max_limit.clamp(1, MAX_LIMIT);
    let limit = params.limit.unwrap_or(default_limit).clamp(1, max_limit);

    let vector_filter = (filter.session_id.is_some()
        || filter.endpoint.is_some()
        || filter.event_type.is_some())
    .then(|| VectorFilter {
        session_id: filter.session_id.clone(),
        agent_id: filter.agent_id.clone(),
        endpoint: filter.endpoint.clone(),
        tipo: filter.event_type,
        exito: filter.success,
    });

    let query = EventQuery {
        filter,
        order,
        limit,
        offset: 0,
    };
    let sql = describe_sql(&query);

    Ok(BuiltQuery {
        query,
        vector_filter,
        intent_applied: hints.applied,
        sql,
    })
}

// ── SQL rendering ─────────────────────────────────────────────────────────────

/// Accumulates `WHERE` clauses with numbered placeholders.
///
/// `first_placeholder` lets callers reserve `?1..?n` for their own parameters
/// (e.g. the query vector).
#[derive(Debug, Default)]
pub struct SqlBuilder {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
    offset: usize,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_after(reserved: usize) -> Self {
        Self {
            offset: reserved,
            ..Self::default()
        }
    }

    /// Bind a value and return its placeholder.
    pub fn bind(&mut self, value: impl Into<SqlValue>) -> String {
        self.params.push(value.into());
        format!("?{}", self.offset + self.params.len())
    }

    pub fn push(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    pub fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn into_params(self) -> Vec<SqlValue> {
        self.params
    }
}

/// Escape `%`, `_`, and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Append event filter predicates to `sql`.
pub fn apply_event_filter(sql: &mut SqlBuilder, filter: &EventFilter) {
    if let Some(ref v) = filter.session_id {
        let p = sql.bind(v.clone());
        sql.push(format!("session_id = {p}"));
    }
    if let Some(ref v) = filter.agent_id {
        let p = sql.bind(v.clone());
        sql.push(format!("agent_id = {p}"));
    }
    if let Some(ref v) = filter.endpoint {
        let p = sql.bind(v.clone());
        sql.push(format!("endpoint = {p}"));
    }
    if let Some(v) = filter.event_type {
        let p = sql.bind(v.as_str().to_string());
        sql.push(format!("event_type = {p}"));
    }
    if let Some(v) = filter.success {
        let p = sql.bind(v as i64);
        sql.push(format!("success = {p}"));
    }
    if let Some(v) = filter.since {
        let p = sql.bind(v.timestamp());
        sql.push(format!("ts_epoch >= {p}"));
    }
    if let Some(v) = filter.until {
        let p = sql.bind(v.timestamp());
        sql.push(format!("ts_epoch <= {p}"));
    }
    if let Some(ref v) = filter.contains {
        let p = sql.bind(format!("%{}%", escape_like(v)));
        sql.push(format!("texto_semantico LIKE {p} ESCAPE '\\'"));
    }
    if !filter.any_terms.is_empty() {
        let ors: Vec<String> = filter
            .any_terms
            .iter()
            .map(|term| {
                let p = sql.bind(format!("%{}%", escape_like(term)));
                format!("texto_semantico LIKE {p} ESCAPE '\\'")
            })
            .collect();
        sql.push(format!("({})", ors.join(" OR ")));
    }
    if let Some(n) = filter.min_text_len {
        let p = sql.bind(n as i64);
        sql.push(format!("length(texto_semantico) > {p}"));
    }
}

/// Append vector filter predicates, qualifying columns with `alias`.
pub fn apply_vector_filter(sql: &mut SqlBuilder, filter: &VectorFilter, alias: &str) {
    if let Some(ref v) = filter.session_id {
        let p = sql.bind(v.clone());
        sql.push(format!("{alias}.session_id = {p}"));
    }
    if let Some(ref v) = filter.agent_id {
        let p = sql.bind(v.clone());
        sql.push(format!("{alias}.agent_id = {p}"));
    }
    if let Some(ref v) = filter.endpoint {
        let p = sql.bind(v.clone());
        sql.push(format!("{alias}.endpoint = {p}"));
    }
    if let Some(v) = filter.tipo {
        let p = sql.bind(v.as_str().to_string());
        sql.push(format!("{alias}.tipo = {p}"));
    }
    if let Some(v) = filter.exito {
        let p = sql.bind(v as i64);
        sql.push(format!("{alias}.exito = {p}"));
    }
}

/// `ORDER BY ... LIMIT ...` tail for an event query. `seq` breaks ties within a
/// second so arrival order is preserved.
pub fn order_and_limit(query: &EventQuery) -> String {
    let dir = query.order.as_sql();
    let page = format!("ORDER BY ts_epoch {dir}, seq {dir} LIMIT {}", query.limit);
    if query.offset > 0 {
        format!("{page} OFFSET {}", query.offset)
    } else {
        page
    }
}

/// Human-readable SQL for a query, placeholders left unbound.
pub fn describe_sql(query: &EventQuery) -> String {
    let mut sql = SqlBuilder::new();
    apply_event_filter(&mut sql, &query.filter);
    let where_clause = sql.where_clause();
    if where_clause.is_empty() {
        order_and_limit(query)
    } else {
        format!("{where_clause} {}", order_and_limit(query))
    }
}
