use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tscache_model::ScalarType;

use crate::aggregation::Aggregation;
use crate::clause::Clause;
use crate::error::ParseError;
use crate::lexer::{Token, tokenize};
use crate::operator::Operator;
use crate::time::{TimeWindow, parse_duration, parse_timestamp};

/// Keywords that may follow the WHERE / GROUP BY part of a query.
const MODIFIERS: &[&str] = &["fill", "order", "limit", "offset", "slimit", "soffset", "tz"];

/// Structured view of a query: everything the segment builder needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub measurement: String,
    pub fields: Vec<String>,
    /// Non-time predicates in source order.
    pub clauses: Vec<Clause>,
    pub time: TimeWindow,
    pub aggregation: Aggregation,
    pub group_tags: Vec<String>,
    /// Trailing modifiers (`fill`, `limit`, `order`, ...), lowercased.
    pub modifiers: Vec<String>,
}

impl ParsedQuery {
    /// Whether results of this query are a pure function of its segment.
    /// Row-shaping modifiers such as `LIMIT` or `fill` are not encoded in
    /// the key, so such queries must bypass the cache.
    pub fn is_cacheable(&self) -> bool {
        self.modifiers.iter().all(|m| m == "tz")
    }
}

/// Parse a query, resolving `now()` against the system clock.
pub fn parse_query(query: &str) -> Result<ParsedQuery, ParseError> {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    parse_query_at(query, now)
}

/// Parse a query with `now()` fixed to `now` nanoseconds.
pub fn parse_query_at(query: &str, now: i64) -> Result<ParsedQuery, ParseError> {
    let tokens = tokenize(query)?;
    Parser {
        tokens,
        pos: 0,
        now,
    }
    .parse()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    now: i64,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, kw: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(kw))
    }

    fn expect_keyword(&mut self, kw: &'static str) -> Result<(), ParseError> {
        match self.next() {
            Some(t) if t.is_keyword(kw) => Ok(()),
            Some(t) => Err(ParseError::Unexpected {
                found: t.describe(),
                expected: kw,
            }),
            None => Err(ParseError::UnexpectedEnd(kw)),
        }
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), ParseError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(ParseError::Unexpected {
                found: t.describe(),
                expected,
            }),
            None => Err(ParseError::UnexpectedEnd(expected)),
        }
    }

    fn parse(mut self) -> Result<ParsedQuery, ParseError> {
        self.expect_keyword("SELECT")?;
        let (fields, function) = self.parse_fields()?;
        self.expect_keyword("FROM")?;
        let measurement = self.parse_measurement()?;

        let mut clauses = Vec::new();
        let mut time = TimeWindow::unbounded();
        if self.at_keyword("WHERE") {
            self.pos += 1;
            self.parse_conjunction(&mut clauses, &mut time)?;
        }

        let mut aggregation = Aggregation {
            function,
            interval: None,
        };
        let mut group_tags = Vec::new();
        if self.at_keyword("GROUP") {
            self.pos += 1;
            self.expect_keyword("BY")?;
            self.parse_group_by(&mut aggregation, &mut group_tags)?;
        }

        let modifiers = self.parse_modifiers()?;

        Ok(ParsedQuery {
            measurement,
            fields,
            clauses,
            time,
            aggregation,
            group_tags,
            modifiers,
        })
    }

    // ── SELECT / FROM ──────────────────────────────────────────

    /// Collect field names and the outermost aggregate function of the
    /// select list. Arithmetic and aliases are skipped.
    fn parse_fields(&mut self) -> Result<(Vec<String>, Option<String>), ParseError> {
        let mut fields = Vec::new();
        let mut function = None;
        let mut depth = 0usize;
        let mut after_as = false;

        while let Some(token) = self.peek() {
            if depth == 0 && token.is_keyword("FROM") {
                break;
            }
            let token = self.next().ok_or(ParseError::UnexpectedEnd("FROM"))?;
            let was_alias = after_as;
            after_as = false;

            match token {
                Token::Ident(name) if matches!(self.peek(), Some(Token::LParen)) => {
                    if function.is_none() {
                        function = Some(name.to_ascii_lowercase());
                    }
                }
                Token::Ident(name) if name.eq_ignore_ascii_case("AS") => after_as = true,
                Token::Ident(name) | Token::QuotedIdent(name) => {
                    if !was_alias && !fields.contains(&name) {
                        fields.push(name);
                    }
                }
                Token::Star => {
                    if !fields.iter().any(|f| f == "*") {
                        fields.push("*".to_string());
                    }
                }
                Token::LParen => depth += 1,
                Token::RParen => depth = depth.saturating_sub(1),
                _ => {}
            }
        }

        if fields.is_empty() {
            return Err(match self.peek() {
                Some(t) => ParseError::Unexpected {
                    found: t.describe(),
                    expected: "field list",
                },
                None => ParseError::UnexpectedEnd("field list"),
            });
        }
        Ok((fields, function))
    }

    /// `cpu`, `"cpu"`, `db.rp.cpu` or `"db"."rp"."cpu"`; the last part names
    /// the measurement. Dots inside a quoted name are part of the name.
    fn parse_measurement(&mut self) -> Result<String, ParseError> {
        loop {
            let name = match self.next() {
                // `db.rp.` lexes as one identifier ahead of a quoted name.
                Some(Token::Ident(name)) if name.ends_with('.') => continue,
                Some(Token::Ident(name)) => match name.rsplit_once('.') {
                    Some((_, last)) => last.to_string(),
                    None => name,
                },
                Some(Token::QuotedIdent(name)) => name,
                Some(t) => {
                    return Err(ParseError::Unexpected {
                        found: t.describe(),
                        expected: "measurement",
                    });
                }
                None => return Err(ParseError::UnexpectedEnd("measurement")),
            };
            if !matches!(self.peek(), Some(Token::Other('.'))) {
                return Ok(name);
            }
            self.pos += 1;
        }
    }

    fn parse_identifier(&mut self, expected: &'static str) -> Result<String, ParseError> {
        match self.next() {
            Some(Token::Ident(name)) | Some(Token::QuotedIdent(name)) => Ok(name),
            Some(t) => Err(ParseError::Unexpected {
                found: t.describe(),
                expected,
            }),
            None => Err(ParseError::UnexpectedEnd(expected)),
        }
    }

    // ── WHERE ──────────────────────────────────────────────────

    fn parse_conjunction(
        &mut self,
        clauses: &mut Vec<Clause>,
        time: &mut TimeWindow,
    ) -> Result<(), ParseError> {
        loop {
            self.parse_term(clauses, time)?;
            match self.peek() {
                Some(t) if t.is_keyword("AND") => self.pos += 1,
                Some(t) if t.is_keyword("OR") => return Err(ParseError::Disjunction),
                _ => return Ok(()),
            }
        }
    }

    fn parse_term(
        &mut self,
        clauses: &mut Vec<Clause>,
        time: &mut TimeWindow,
    ) -> Result<(), ParseError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.pos += 1;
            self.parse_conjunction(clauses, time)?;
            return self.expect(Token::RParen, ")");
        }
        self.parse_comparison(clauses, time)
    }

    fn parse_comparison(
        &mut self,
        clauses: &mut Vec<Clause>,
        time: &mut TimeWindow,
    ) -> Result<(), ParseError> {
        let field = self.parse_identifier("field")?;
        let operator = match self.next() {
            Some(Token::Op(op)) => Operator::parse(&op)?,
            Some(other) => return Err(ParseError::UnknownOperator(other.describe())),
            None => return Err(ParseError::UnexpectedEnd("operator")),
        };

        if field.eq_ignore_ascii_case("time") {
            let ts = self.parse_time_expr()?;
            return apply_time_bound(time, operator, ts);
        }

        let (literal, scalar_type) = self.parse_literal(operator)?;
        clauses.push(Clause {
            field,
            operator,
            literal,
            scalar_type,
        });
        Ok(())
    }

    fn parse_literal(&mut self, operator: Operator) -> Result<(String, ScalarType), ParseError> {
        let token = self.next().ok_or(ParseError::UnexpectedEnd("literal"))?;

        if operator.is_regex() {
            return match token {
                Token::Regex { raw, pattern } => {
                    Regex::new(&pattern).map_err(|e| ParseError::InvalidRegex {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?;
                    Ok((raw, ScalarType::String))
                }
                other => Err(ParseError::Unexpected {
                    found: other.describe(),
                    expected: "regex literal",
                }),
            };
        }

        match token {
            Token::Str { raw, .. } => Ok((raw, ScalarType::String)),
            Token::Number(n) => number_literal(n),
            Token::Minus => match self.next() {
                Some(Token::Number(n)) => number_literal(format!("-{n}")),
                Some(other) => Err(ParseError::UntypedLiteral(format!("-{}", other.describe()))),
                None => Err(ParseError::UnexpectedEnd("literal")),
            },
            Token::Ident(word) if word.eq_ignore_ascii_case("true") => {
                Ok(("true".to_string(), ScalarType::Bool))
            }
            Token::Ident(word) if word.eq_ignore_ascii_case("false") => {
                Ok(("false".to_string(), ScalarType::Bool))
            }
            other => Err(ParseError::UntypedLiteral(other.describe())),
        }
    }

    /// `now()`, an RFC3339 string, an integer epoch in nanoseconds or a
    /// duration-suffixed epoch, optionally followed by `+`/`-` durations.
    fn parse_time_expr(&mut self) -> Result<i64, ParseError> {
        let mut ts = self.parse_time_term()?;
        loop {
            let sign = match self.peek() {
                Some(Token::Plus) => 1,
                Some(Token::Minus) => -1,
                _ => return Ok(ts),
            };
            self.pos += 1;
            let offset = match self.next() {
                Some(Token::Duration(d)) => parse_duration(&d)?,
                Some(Token::Number(n)) => n
                    .parse::<i64>()
                    .map_err(|_| ParseError::InvalidDuration(n.clone()))?,
                Some(other) => return Err(ParseError::InvalidDuration(other.describe())),
                None => return Err(ParseError::UnexpectedEnd("duration")),
            };
            ts = ts
                .checked_add(sign * offset)
                .ok_or_else(|| ParseError::InvalidTime("time arithmetic overflows".into()))?;
        }
    }

    fn parse_time_term(&mut self) -> Result<i64, ParseError> {
        match self.next() {
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("now") => {
                self.expect(Token::LParen, "(")?;
                self.expect(Token::RParen, ")")?;
                Ok(self.now)
            }
            Some(Token::Str { value, .. }) => parse_timestamp(&value),
            Some(Token::Number(n)) => n.parse::<i64>().map_err(|_| ParseError::InvalidTime(n)),
            Some(Token::Duration(d)) => parse_duration(&d),
            Some(Token::Minus) => Ok(-self.parse_time_term()?),
            Some(other) => Err(ParseError::InvalidTime(other.describe())),
            None => Err(ParseError::UnexpectedEnd("time literal")),
        }
    }

    // ── GROUP BY ───────────────────────────────────────────────

    fn parse_group_by(
        &mut self,
        aggregation: &mut Aggregation,
        group_tags: &mut Vec<String>,
    ) -> Result<(), ParseError> {
        loop {
            match self.next() {
                Some(Token::Ident(word))
                    if word.eq_ignore_ascii_case("time")
                        && matches!(self.peek(), Some(Token::LParen)) =>
                {
                    self.pos += 1;
                    let interval = match self.next() {
                        Some(Token::Duration(d)) => {
                            parse_duration(&d)?;
                            d
                        }
                        Some(other) => return Err(ParseError::InvalidDuration(other.describe())),
                        None => return Err(ParseError::UnexpectedEnd("interval")),
                    };
                    // Skip an optional offset argument.
                    loop {
                        match self.next() {
                            Some(Token::RParen) => break,
                            Some(_) => {}
                            None => return Err(ParseError::UnexpectedEnd(")")),
                        }
                    }
                    aggregation.interval = Some(interval);
                }
                Some(Token::Ident(tag)) | Some(Token::QuotedIdent(tag)) => group_tags.push(tag),
                Some(Token::Star) => group_tags.push("*".to_string()),
                Some(other) => {
                    return Err(ParseError::Unexpected {
                        found: other.describe(),
                        expected: "GROUP BY dimension",
                    });
                }
                None => return Err(ParseError::UnexpectedEnd("GROUP BY dimension")),
            }

            if matches!(self.peek(), Some(Token::Comma)) {
                self.pos += 1;
            } else {
                return Ok(());
            }
        }
    }

    // ── Trailing modifiers ─────────────────────────────────────

    fn parse_modifiers(&mut self) -> Result<Vec<String>, ParseError> {
        let mut modifiers = Vec::new();
        match self.peek() {
            None | Some(Token::Other(';')) => return Ok(modifiers),
            Some(t) if MODIFIERS.iter().any(|m| t.is_keyword(m)) => {}
            Some(t) => {
                return Err(ParseError::Unexpected {
                    found: t.describe(),
                    expected: "AND, GROUP BY or end of query",
                });
            }
        }

        while let Some(token) = self.next() {
            if let Token::Ident(word) = &token {
                let word = word.to_ascii_lowercase();
                if MODIFIERS.contains(&word.as_str()) && !modifiers.contains(&word) {
                    modifiers.push(word);
                }
            }
        }
        Ok(modifiers)
    }
}

fn number_literal(text: String) -> Result<(String, ScalarType), ParseError> {
    if text.contains(['.', 'e', 'E']) {
        text.parse::<f64>()
            .map(|_| (text.clone(), ScalarType::Float64))
            .map_err(|_| ParseError::UntypedLiteral(text))
    } else {
        text.parse::<i64>()
            .map(|_| (text.clone(), ScalarType::Int64))
            .map_err(|_| ParseError::UntypedLiteral(text))
    }
}

fn apply_time_bound(time: &mut TimeWindow, operator: Operator, ts: i64) -> Result<(), ParseError> {
    match operator {
        Operator::Gt => time.narrow_start(ts.saturating_add(1)),
        Operator::Gte => time.narrow_start(ts),
        Operator::Lt => time.narrow_end(ts.saturating_sub(1)),
        Operator::Lte => time.narrow_end(ts),
        Operator::Eq => {
            time.narrow_start(ts);
            time.narrow_end(ts);
        }
        other => return Err(ParseError::UnknownOperator(format!("time {other}"))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000_000_000;
    const JAN_1_2022: i64 = 1_640_995_200_000_000_000;

    #[test]
    fn simple_select() {
        let q = parse_query("SELECT usage_user FROM cpu").unwrap();
        assert_eq!(q.measurement, "cpu");
        assert_eq!(q.fields, vec!["usage_user"]);
        assert!(q.clauses.is_empty());
        assert_eq!(q.time, TimeWindow::unbounded());
        assert!(q.aggregation.is_empty());
        assert!(q.is_cacheable());
    }

    #[test]
    fn where_clauses_and_time_window() {
        let q = parse_query(
            "SELECT usage_user,usage_system FROM \"cpu\" WHERE \"hostname\"='host_0' \
             AND usage_user > 10 AND time >= '2022-01-01T00:00:00Z' \
             AND time < '2022-01-01T01:00:00Z'",
        )
        .unwrap();

        assert_eq!(q.fields, vec!["usage_user", "usage_system"]);
        let rendered: Vec<String> = q.clauses.iter().map(Clause::render).collect();
        assert_eq!(
            rendered,
            vec!["(hostname='host_0'[string])", "(usage_user>10[int64])"]
        );
        assert_eq!(q.time, TimeWindow::new(JAN_1_2022, JAN_1_2022 + HOUR - 1));
    }

    #[test]
    fn literal_type_inference() {
        let q = parse_query(
            "SELECT * FROM m WHERE a = 1 AND b = 1.5 AND c = -2 AND d = true AND e = 'x' AND f =~ /y.*/",
        )
        .unwrap();
        let types: Vec<ScalarType> = q.clauses.iter().map(|c| c.scalar_type).collect();
        assert_eq!(
            types,
            vec![
                ScalarType::Int64,
                ScalarType::Float64,
                ScalarType::Int64,
                ScalarType::Bool,
                ScalarType::String,
                ScalarType::String,
            ]
        );
        assert_eq!(q.clauses[2].literal, "-2");
        assert_eq!(q.clauses[5].render(), r"(f=~/y\.*/[string])");
    }

    #[test]
    fn aggregation_and_group_by() {
        let q = parse_query(
            "SELECT max(usage_user) FROM cpu WHERE time > now() - 1h GROUP BY \"hostname\", time(1m)",
        )
        .unwrap();
        assert_eq!(q.fields, vec!["usage_user"]);
        assert_eq!(q.aggregation.render(), "max,1m");
        assert_eq!(q.group_tags, vec!["hostname"]);
    }

    #[test]
    fn relative_time_uses_fixed_now() {
        let now = JAN_1_2022 + 2 * HOUR;
        let q = parse_query_at("SELECT v FROM m WHERE time >= now() - 2h AND time <= now()", now)
            .unwrap();
        assert_eq!(q.time, TimeWindow::new(JAN_1_2022, now));
    }

    #[test]
    fn integer_and_suffixed_epochs() {
        let q = parse_query("SELECT v FROM m WHERE time >= 1640995200s AND time <= 1640995200000000000")
            .unwrap();
        assert_eq!(q.time, TimeWindow::new(JAN_1_2022, JAN_1_2022));
    }

    #[test]
    fn parenthesised_conjunction() {
        let q = parse_query("SELECT v FROM m WHERE (a = 1 AND (b = 2)) AND time = 5").unwrap();
        assert_eq!(q.clauses.len(), 2);
        assert_eq!(q.time, TimeWindow::new(5, 5));
    }

    #[test]
    fn disjunction_is_rejected() {
        let err = parse_query("SELECT v FROM m WHERE a = 1 OR b = 2").unwrap_err();
        assert_eq!(err, ParseError::Disjunction);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = parse_query("SELECT v FROM m WHERE a => 1").unwrap_err();
        assert_eq!(err, ParseError::UnknownOperator("=>".into()));

        let err = parse_query("SELECT v FROM m WHERE a LIKE 'x'").unwrap_err();
        assert_eq!(err, ParseError::UnknownOperator("LIKE".into()));
    }

    #[test]
    fn untyped_literal_is_rejected() {
        let err = parse_query("SELECT v FROM m WHERE a = other_field").unwrap_err();
        assert_eq!(err, ParseError::UntypedLiteral("other_field".into()));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = parse_query("SELECT v FROM m WHERE host =~ /[a/").unwrap_err();
        assert!(matches!(err, ParseError::InvalidRegex { .. }), "{err:?}");
    }

    #[test]
    fn time_inequality_is_rejected() {
        let err = parse_query("SELECT v FROM m WHERE time != 5").unwrap_err();
        assert!(matches!(err, ParseError::UnknownOperator(_)));
    }

    #[test]
    fn modifiers_make_query_uncacheable() {
        let q = parse_query("SELECT mean(v) FROM m GROUP BY time(5m) fill(0) LIMIT 10").unwrap();
        assert_eq!(q.modifiers, vec!["fill", "limit"]);
        assert!(!q.is_cacheable());
    }

    #[test]
    fn trailing_garbage_errors() {
        let err = parse_query("SELECT v FROM m WHERE a = 1 b = 2").unwrap_err();
        assert!(matches!(err, ParseError::Unexpected { .. }));
    }

    #[test]
    fn qualified_measurement() {
        let q = parse_query("SELECT v FROM \"telegraf\".\"autogen\".\"cpu\"").unwrap();
        assert_eq!(q.measurement, "cpu");
        let q = parse_query("SELECT v FROM telegraf.autogen.mem").unwrap();
        assert_eq!(q.measurement, "mem");
        let q = parse_query("SELECT v FROM telegraf.\"system.cpu\"").unwrap();
        assert_eq!(q.measurement, "system.cpu");
    }

    #[test]
    fn missing_from_errors() {
        assert_eq!(
            parse_query("SELECT v").unwrap_err(),
            ParseError::UnexpectedEnd("FROM")
        );
    }
}
