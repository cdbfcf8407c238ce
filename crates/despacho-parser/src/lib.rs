// SPDX-License-Identifier: MIT OR Apache-2.0
//! Email parsing: subject → route, body → clients and product lines.
//!
//! The body grammar is a single top-to-bottom scan with one open client at
//! a time. Anything that does not fit the grammar degrades to a warning
//! rather than failing the lote; the only hard error is a client header
//! without a name.
#![deny(unsafe_code)]

use despacho_norm::norm;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use std::sync::LazyLock;

static CLIENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^Cliente:\s*(.*)$").expect("client pattern"));
static OBSERVATIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^Observaciones:\s*(.*)$").expect("observations pattern"));
static PRODUCT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:[.,]\d+)?)\s+(.*?)\s*-\s*(.+)\s*-\s*(\d+(?:[.,]\d+)?)\s*$")
        .expect("product pattern")
});

// ---------------------------------------------------------------------------
// Subject
// ---------------------------------------------------------------------------

/// Resolve a subject line against the active routes catalog.
///
/// `routes` is the set of normalized route names of the active version.
/// `Err` carries the normalized key that failed the lookup, for the
/// `ROUTE_PARSE_ERROR` payload.
pub fn parse_subject<'a, I>(subject: &str, routes: I) -> Result<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let key = norm(subject);
    if !key.is_empty() && routes.into_iter().any(|r| r == key) {
        Ok(key)
    } else {
        Err(key)
    }
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

/// One parsed product line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedLine {
    /// Ordered quantity.
    pub quantity: Decimal,
    /// Unit as written.
    pub unit_raw: String,
    /// Product as written.
    pub product_raw: String,
    /// Unit price.
    pub price: Decimal,
}

/// One parsed client section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedClient {
    /// Client name as written.
    pub name: String,
    /// Observations attached right under the client header.
    pub observations: Option<String>,
    /// Product lines, in order of appearance.
    pub lines: Vec<ParsedLine>,
}

/// Severity of a [`ParseIssue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IssueLevel {
    /// Degradation; the parse can still succeed.
    Warning,
    /// Hard failure; the parse cannot succeed.
    Error,
}

/// One diagnostic emitted while scanning a body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseIssue {
    /// Severity.
    pub level: IssueLevel,
    /// Human-readable description.
    pub message: String,
    /// 1-based body line number, when tied to one.
    pub line_no: Option<usize>,
}

/// Full result of a body scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BodyParse {
    /// Clients in order of appearance (possibly with zero lines).
    pub clients: Vec<ParsedClient>,
    /// Warnings and errors, in scan order.
    pub issues: Vec<ParseIssue>,
}

impl BodyParse {
    /// Successful iff at least one client was emitted and no hard error
    /// occurred.
    pub fn is_success(&self) -> bool {
        !self.clients.is_empty() && self.issues.iter().all(|i| i.level != IssueLevel::Error)
    }

    fn warn(&mut self, message: impl Into<String>, line_no: usize) {
        self.issues.push(ParseIssue {
            level: IssueLevel::Warning,
            message: message.into(),
            line_no: Some(line_no),
        });
    }

    fn error(&mut self, message: impl Into<String>, line_no: usize) {
        self.issues.push(ParseIssue {
            level: IssueLevel::Error,
            message: message.into(),
            line_no: Some(line_no),
        });
    }
}

/// Scan a body into clients and lines.
pub fn parse_body(body: &str) -> BodyParse {
    let mut out = BodyParse::default();
    let mut current: Option<ParsedClient> = None;
    // Set right after a client header opens; cleared by the next
    // significant line. Observations attach only in that window.
    let mut at_client_header = false;

    for (idx, raw_line) in body.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || is_separator(line) {
            continue;
        }

        if let Some(caps) = CLIENT_RE.captures(line) {
            let name = caps[1].trim().to_string();
            flush(&mut current, &mut out);
            if name.is_empty() {
                out.error("client without name", line_no);
                at_client_header = false;
                continue;
            }
            current = Some(ParsedClient {
                name,
                observations: None,
                lines: Vec::new(),
            });
            at_client_header = true;
            continue;
        }

        if at_client_header {
            at_client_header = false;
            if let Some(caps) = OBSERVATIONS_RE.captures(line) {
                if let Some(client) = current.as_mut() {
                    let obs = caps[1].trim();
                    client.observations = (!obs.is_empty()).then(|| obs.to_string());
                }
                continue;
            }
        }

        if let Some(caps) = PRODUCT_RE.captures(line) {
            let parsed = parse_decimal(&caps[1]).and_then(|quantity| {
                parse_decimal(&caps[4]).map(|price| ParsedLine {
                    quantity,
                    unit_raw: caps[2].trim().to_string(),
                    product_raw: caps[3].trim().to_string(),
                    price,
                })
            });
            match (parsed, current.as_mut()) {
                (Some(line_item), Some(client)) => client.lines.push(line_item),
                (Some(_), None) => out.warn("product line with no client", line_no),
                (None, _) => out.warn("misformatted line", line_no),
            }
            continue;
        }

        if current.is_some() {
            out.warn("misformatted line", line_no);
        }
        // Noise outside any client that is not product-shaped is ignored.
    }

    flush(&mut current, &mut out);
    out
}

/// Close the open client, warning when it gathered no lines.
fn flush(current: &mut Option<ParsedClient>, out: &mut BodyParse) {
    if let Some(client) = current.take() {
        if client.lines.is_empty() {
            out.issues.push(ParseIssue {
                level: IssueLevel::Warning,
                message: format!("client without products: {}", client.name),
                line_no: None,
            });
        }
        out.clients.push(client);
    }
}

/// Visual separator rows (`-----`, `=====`, ...) carry no content.
fn is_separator(line: &str) -> bool {
    line.len() >= 3 && line.chars().all(|c| matches!(c, '-' | '=' | '_' | '*'))
}

/// Parse a decimal accepting either comma or dot as separator.
fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(&s.replace(',', ".")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn subject_resolves_through_norm() {
        let routes = ["RUTA NORTE", "RUTA SUR"];
        assert_eq!(
            parse_subject("  Ruta   Norte ", routes),
            Ok("RUTA NORTE".into())
        );
        assert_eq!(parse_subject("Ruta Este", routes), Err("RUTA ESTE".into()));
        assert_eq!(parse_subject("", routes), Err(String::new()));
    }

    #[test]
    fn single_client_single_line() {
        let parse = parse_body("Cliente: Super Uno\n1 L - Leche - 1.20");
        assert!(parse.is_success());
        assert_eq!(parse.clients.len(), 1);
        let client = &parse.clients[0];
        assert_eq!(client.name, "Super Uno");
        assert_eq!(client.observations, None);
        assert_eq!(
            client.lines,
            vec![ParsedLine {
                quantity: dec("1"),
                unit_raw: "L".into(),
                product_raw: "Leche".into(),
                price: dec("1.20"),
            }]
        );
    }

    #[test]
    fn observations_attach_only_right_after_header() {
        let parse = parse_body(
            "Cliente: Super Uno\nObservaciones: entregar temprano\n2 kg - Pan - 0,80\nObservaciones: tarde\n",
        );
        let client = &parse.clients[0];
        assert_eq!(client.observations.as_deref(), Some("entregar temprano"));
        assert_eq!(client.lines.len(), 1);
        assert_eq!(client.lines[0].quantity, dec("2"));
        assert_eq!(client.lines[0].price, dec("0.80"));
        // The second Observaciones line is just a misformatted line.
        assert!(
            parse
                .issues
                .iter()
                .any(|i| i.message == "misformatted line")
        );
    }

    #[test]
    fn comma_decimals_and_dashed_products() {
        let parse = parse_body("Cliente: Bar Dos\n0,5 kg - Queso semi-curado - 3,40");
        let line = &parse.clients[0].lines[0];
        assert_eq!(line.quantity, dec("0.5"));
        assert_eq!(line.unit_raw, "kg");
        assert_eq!(line.product_raw, "Queso semi-curado");
        assert_eq!(line.price, dec("3.40"));
    }

    #[test]
    fn client_without_name_is_hard_error() {
        let parse = parse_body("Cliente:\n1 L - Leche - 1.20");
        assert!(!parse.is_success());
        assert!(
            parse
                .issues
                .iter()
                .any(|i| i.level == IssueLevel::Error && i.message == "client without name")
        );
    }

    #[test]
    fn orphan_product_line_is_warning() {
        let parse = parse_body("1 L - Leche - 1.20\nCliente: Super Uno\n2 L - Leche - 1.20");
        assert!(parse.is_success());
        assert_eq!(parse.clients[0].lines.len(), 1);
        assert!(
            parse
                .issues
                .iter()
                .any(|i| i.message == "product line with no client")
        );
    }

    #[test]
    fn client_without_products_is_retained_with_warning() {
        let parse = parse_body("Cliente: Vacio\nCliente: Lleno\n1 u - Pan - 0.50");
        assert!(parse.is_success());
        assert_eq!(parse.clients.len(), 2);
        assert_eq!(parse.clients[0].name, "Vacio");
        assert!(parse.clients[0].lines.is_empty());
        assert!(
            parse
                .issues
                .iter()
                .any(|i| i.message.starts_with("client without products"))
        );
    }

    #[test]
    fn separators_and_blank_lines_are_skipped() {
        let parse = parse_body("-----\nCliente: Super Uno\n=====\n\r\n1 L - Leche - 1.20\n*****");
        assert!(parse.is_success());
        assert_eq!(parse.clients[0].lines.len(), 1);
        assert!(parse.issues.is_empty());
    }

    #[test]
    fn empty_body_fails() {
        assert!(!parse_body("").is_success());
        assert!(!parse_body("nothing to see here").is_success());
    }

    #[test]
    fn misformatted_line_inside_client_warns() {
        let parse = parse_body("Cliente: Super Uno\n1 L - Leche - 1.20\nmedia docena de huevos");
        assert!(parse.is_success());
        let warnings: Vec<_> = parse
            .issues
            .iter()
            .filter(|i| i.message == "misformatted line")
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].line_no, Some(3));
    }

    #[test]
    fn case_insensitive_headers() {
        let parse = parse_body("CLIENTE: Super Uno\nOBSERVACIONES: ojo\n1 L - Leche - 1.20");
        assert_eq!(parse.clients[0].observations.as_deref(), Some("ojo"));
    }
}
