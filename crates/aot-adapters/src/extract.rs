//! Pattern-based extraction of dates, amounts, requirements and required
//! documents from free text.
//!
//! Works over lower-cased, accent-folded tokens. Nothing here fails: a miss is
//! reported as `None`.

use aot_core::{fold_case_and_accents, Amount};
use chrono::NaiveDate;

/// Values recovered from free text; `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub closing_date: Option<NaiveDate>,
    pub opening_date: Option<NaiveDate>,
    pub amount: Option<Amount>,
    pub requirements: Option<String>,
    pub required_documents: Option<String>,
}

pub trait FieldExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Extracted;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PatternExtractor;

impl FieldExtractor for PatternExtractor {
    fn extract(&self, text: &str) -> Extracted {
        if text.trim().is_empty() {
            return Extracted::default();
        }
        Extracted {
            closing_date: find_deadline(text),
            opening_date: find_opening_date(text),
            amount: extract_amount(text),
            requirements: extract_requirements(text),
            required_documents: extract_required_documents(text),
        }
    }
}

const DEADLINE_KEYWORDS: &[&[&str]] = &[
    &["fecha", "limite"],
    &["fecha", "de", "cierre"],
    &["closing", "date"],
    &["cierre"],
    &["deadline"],
    &["hasta", "el"],
    &["close"],
    &["vence"],
    &["plazo"],
];

const OPENING_KEYWORDS: &[&[&str]] = &[
    &["apertura"],
    &["inicio"],
    &["open"],
    &["desde"],
    &["a", "partir", "de"],
];

const REQUIREMENT_KEYWORDS: &[&str] = &[
    "requisitos",
    "requisito",
    "requirements",
    "requirement",
    "elegibilidad",
    "eligibility",
    "perfil",
    "dirigido a",
    "dirigida a",
    "who can apply",
];

const DOCUMENT_KEYWORDS: &[&str] = &[
    "documentos requeridos",
    "documento requerido",
    "documentos necesarios",
    "documento necesario",
    "documentos a presentar",
    "debe presentar",
    "se debe enviar",
    "documentacion",
    "adjuntar",
    "annexes",
    "anexos",
];

/// Tokens before / after a keyword that count as "near" it.
const WINDOW_BEFORE: usize = 3;
const WINDOW_AFTER: usize = 25;

const MIN_YEAR: i32 = 2020;
const MAX_YEAR: i32 = 2035;

fn tokenize(text: &str) -> Vec<String> {
    fold_case_and_accents(text)
        .split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| {
                matches!(c, ',' | ';' | ':' | '(' | ')' | '[' | ']' | '"' | '\'' | '.' | '¡' | '!' | '¿' | '?')
            })
            .to_string()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

fn month_number(word: &str) -> Option<u32> {
    let month = match word {
        "enero" | "ene" | "january" | "jan" => 1,
        "febrero" | "feb" | "february" => 2,
        "marzo" | "mar" | "march" => 3,
        "abril" | "abr" | "april" | "apr" => 4,
        "mayo" | "may" => 5,
        "junio" | "jun" | "june" => 6,
        "julio" | "jul" | "july" => 7,
        "agosto" | "ago" | "august" | "aug" => 8,
        "septiembre" | "setiembre" | "sep" | "sept" | "september" => 9,
        "octubre" | "oct" | "october" => 10,
        "noviembre" | "nov" | "november" => 11,
        "diciembre" | "dic" | "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn parse_day(token: &str) -> Option<u32> {
    let digits = token.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    if digits.is_empty() || digits.len() > 2 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|d| (1..=31).contains(d))
}

fn parse_year(token: &str) -> Option<i32> {
    if token.len() != 4 || !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    token.parse().ok().filter(|y| (MIN_YEAR..=MAX_YEAR).contains(y))
}

/// `dd/mm/yyyy`, `dd-mm-yyyy` or `yyyy-mm-dd` inside a single token.
fn parse_numeric_date(token: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = token.split(['/', '-']).collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    let (y, m, d) = if parts[0].len() == 4 {
        (parse_year(parts[0])?, parts[1].parse().ok()?, parts[2].parse().ok()?)
    } else {
        (parse_year(parts[2])?, parts[1].parse().ok()?, parts[0].parse().ok()?)
    };
    NaiveDate::from_ymd_opt(y, m, d)
}

/// Date starting at `tokens[i]`, if any.
fn date_at(tokens: &[String], i: usize) -> Option<NaiveDate> {
    let tok = |k: usize| tokens.get(i + k).map(String::as_str);
    let is_filler = |t: Option<&str>| matches!(t, Some("de") | Some("del") | Some("of"));

    if let Some(date) = parse_numeric_date(&tokens[i]) {
        return Some(date);
    }

    // dd [de] <mes> [de|del] yyyy
    if let Some(day) = parse_day(&tokens[i]) {
        let mut k = 1;
        if is_filler(tok(k)) {
            k += 1;
        }
        if let Some(month) = tok(k).and_then(month_number) {
            k += 1;
            if is_filler(tok(k)) {
                k += 1;
            }
            if let Some(year) = tok(k).and_then(parse_year) {
                return NaiveDate::from_ymd_opt(year, month, day);
            }
        }
    }

    // <month> dd [de] yyyy
    if let Some(month) = month_number(&tokens[i]) {
        if let Some(day) = tok(1).and_then(parse_day) {
            let k = if is_filler(tok(2)) { 3 } else { 2 };
            if let Some(year) = tok(k).and_then(parse_year) {
                return NaiveDate::from_ymd_opt(year, month, day);
            }
        }
    }
    None
}

fn dates_in(tokens: &[String]) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = (0..tokens.len()).filter_map(|i| date_at(tokens, i)).collect();
    dates.sort();
    dates.dedup();
    dates
}

/// All recognizable dates in the text, ascending and de-duplicated.
pub fn extract_dates(text: &str) -> Vec<NaiveDate> {
    dates_in(&tokenize(text))
}

fn keyword_positions<'a>(tokens: &'a [String], phrase: &'a [&'a str]) -> impl Iterator<Item = usize> + 'a {
    (0..tokens.len()).filter(move |&i| {
        phrase
            .iter()
            .enumerate()
            .all(|(k, word)| tokens.get(i + k).is_some_and(|t| t.starts_with(word)))
    })
}

fn window(tokens: &[String], at: usize, phrase_len: usize) -> &[String] {
    let start = at.saturating_sub(WINDOW_BEFORE);
    let end = (at + phrase_len + WINDOW_AFTER).min(tokens.len());
    &tokens[start..end]
}

/// Latest date near a deadline keyword; otherwise the latest date in the text.
pub fn find_deadline(text: &str) -> Option<NaiveDate> {
    let tokens = tokenize(text);
    for phrase in DEADLINE_KEYWORDS {
        for at in keyword_positions(&tokens, phrase) {
            if let Some(last) = dates_in(window(&tokens, at, phrase.len())).pop() {
                return Some(last);
            }
        }
    }
    dates_in(&tokens).pop()
}

/// Earliest date near an opening keyword.
pub fn find_opening_date(text: &str) -> Option<NaiveDate> {
    let tokens = tokenize(text);
    for phrase in OPENING_KEYWORDS {
        for at in keyword_positions(&tokens, phrase) {
            if let Some(first) = dates_in(window(&tokens, at, phrase.len())).first() {
                return Some(*first);
            }
        }
    }
    None
}

/// Parse `13.000.000`, `5,000.50`, `1.200,75` or `3,5` into a number.
fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim_matches(|c: char| !c.is_ascii_digit());
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return None;
    }
    let last_dot = trimmed.rfind('.');
    let last_comma = trimmed.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) if d > c => trimmed.replace(',', ""),
        (Some(_), Some(_)) => trimmed.replace('.', "").replace(',', "."),
        (Some(_), None) => single_separator(trimmed, '.'),
        (None, Some(_)) => single_separator(trimmed, ','),
        (None, None) => trimmed.to_string(),
    };
    normalized.parse().ok()
}

/// A lone separator kind is a thousands separator when every group after it has three digits.
fn single_separator(s: &str, sep: char) -> String {
    let groups: Vec<&str> = s.split(sep).collect();
    if groups.len() > 1 && groups[1..].iter().all(|g| g.len() == 3) {
        groups.concat()
    } else {
        s.replace(sep, ".")
    }
}

fn is_dotted_thousands(s: &str) -> bool {
    let groups: Vec<&str> = s.split('.').collect();
    groups.len() > 1
        && (1..=3).contains(&groups[0].len())
        && groups[1..].iter().all(|g| g.len() == 3)
        && groups.iter().all(|g| g.chars().all(|c| c.is_ascii_digit()))
}

/// Monetary amount: `$13.000.000` (COP), `N millones` (COP), `USD|EUR|GBP N`.
pub fn extract_amount(text: &str) -> Option<Amount> {
    let tokens = tokenize(text);

    for (i, token) in tokens.iter().enumerate() {
        let Some(rest) = token.strip_prefix('$') else {
            continue;
        };
        let digits = if rest.is_empty() {
            tokens.get(i + 1).map(String::as_str).unwrap_or_default()
        } else {
            rest
        };
        if is_dotted_thousands(digits) {
            if let Some(value) = parse_number(digits) {
                return Some(Amount::new(value, "COP"));
            }
        }
    }

    for (i, token) in tokens.iter().enumerate() {
        let next_is_millions = tokens.get(i + 1).is_some_and(|t| t.starts_with("millon"));
        if next_is_millions {
            if let Some(value) = parse_number(token) {
                return Some(Amount::new(value * 1_000_000.0, "COP"));
            }
        }
    }

    for currency in ["usd", "eur", "gbp"] {
        for (i, token) in tokens.iter().enumerate() {
            let Some(rest) = token.strip_prefix(currency) else {
                continue;
            };
            let rest = rest.trim_start_matches('$');
            let candidate = if rest.is_empty() {
                let next = tokens.get(i + 1).map(String::as_str).unwrap_or_default();
                if next == "$" {
                    tokens.get(i + 2).map(String::as_str).unwrap_or_default()
                } else {
                    next.trim_start_matches('$')
                }
            } else {
                rest
            };
            if let Some(value) = parse_number(candidate) {
                return Some(Amount::new(value, currency.to_ascii_uppercase()));
            }
        }
    }
    None
}

/// How far after a heading a section is read, and how much of it is kept.
struct SectionRule {
    keywords: &'static [&'static str],
    window_chars: usize,
    keep_chars: usize,
    min_chars: usize,
    max_sections: usize,
}

const REQUIREMENTS_RULE: SectionRule = SectionRule {
    keywords: REQUIREMENT_KEYWORDS,
    window_chars: 300,
    keep_chars: 300,
    min_chars: 21,
    max_sections: 2,
};

const DOCUMENTS_RULE: SectionRule = SectionRule {
    keywords: DOCUMENT_KEYWORDS,
    window_chars: 400,
    keep_chars: 200,
    min_chars: 11,
    max_sections: 3,
};

/// A section ends at a blank line or at an all-caps heading line.
fn section_end(chunk: &str) -> usize {
    let mut offset = 0;
    for (i, line) in chunk.split_inclusive('\n').enumerate() {
        let trimmed = line.trim();
        let is_heading = trimmed.chars().filter(|c| c.is_alphabetic()).count() > 3
            && !trimmed.chars().any(char::is_lowercase);
        if i > 0 && (trimmed.is_empty() || is_heading) {
            return offset;
        }
        offset += line.len();
    }
    chunk.len()
}

fn extract_sections(text: &str, rule: &SectionRule) -> Option<String> {
    // Same length as `text` in chars, so positions line up.
    let folded: Vec<char> = fold_case_and_accents(text).chars().collect();
    let original: Vec<char> = text.chars().filter(|c| !('\u{0300}'..='\u{036f}').contains(c)).collect();
    let haystack: String = folded.iter().collect();

    let mut sections: Vec<String> = Vec::new();
    let mut seen_at: Vec<usize> = Vec::new();
    for keyword in rule.keywords {
        let Some(byte_pos) = haystack.find(keyword) else {
            continue;
        };
        // "requisito" inside "requisitos"
        if seen_at.contains(&byte_pos) {
            continue;
        }
        seen_at.push(byte_pos);
        let start = haystack[..byte_pos].chars().count() + keyword.chars().count();
        let end = (start + rule.window_chars).min(original.len());
        let chunk: String = original[start..end].iter().collect();
        let chunk = chunk.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
        let chunk = &chunk[..section_end(chunk)];
        let section: String = chunk
            .trim_matches(|c: char| c == ':' || c.is_whitespace())
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(rule.keep_chars)
            .collect();
        if section.chars().count() >= rule.min_chars && !sections.contains(&section) {
            sections.push(section);
        }
        if sections.len() == rule.max_sections {
            break;
        }
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("; "))
    }
}

/// Text following a requirements heading, up to a blank line or 300 chars.
pub fn extract_requirements(text: &str) -> Option<String> {
    extract_sections(text, &REQUIREMENTS_RULE)
}

/// Documents an applicant must submit, read after headings such as
/// "documentos requeridos" or "adjuntar". At most three sections of 200 chars.
pub fn extract_required_documents(text: &str) -> Option<String> {
    extract_sections(text, &DOCUMENTS_RULE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn extracts_spanish_numeric_iso_and_english_dates() {
        let text = "Apertura: 3 de marzo de 2025. Cierre 15/04/2025. Publicado 2025-02-20. \
                    Results on June 5, 2025.";
        assert_eq!(
            extract_dates(text),
            vec![date(2025, 2, 20), date(2025, 3, 3), date(2025, 4, 15), date(2025, 6, 5)]
        );
    }

    #[test]
    fn invalid_calendar_dates_are_skipped() {
        assert!(extract_dates("31/02/2025 y 30 de febrero de 2025").is_empty());
    }

    #[test]
    fn deadline_prefers_dates_near_keywords() {
        let text = "Resultados: 30 de noviembre de 2025. Fecha límite de postulación: \
                    15 de septiembre de 2025 a las 5 pm.";
        assert_eq!(find_deadline(text), Some(date(2025, 9, 15)));
    }

    #[test]
    fn deadline_falls_back_to_latest_date() {
        assert_eq!(
            find_deadline("Publicado el 01/02/2025, actualizado el 10/02/2025"),
            Some(date(2025, 2, 10))
        );
        assert_eq!(find_deadline("sin fechas"), None);
    }

    #[test]
    fn opening_date_uses_earliest_near_keyword() {
        let text = "Inscripciones a partir de 1 de julio de 2025 y hasta el 30 de julio de 2025";
        assert_eq!(find_opening_date(text), Some(date(2025, 7, 1)));
    }

    #[test]
    fn amounts_in_pesos_millions_and_foreign_currency() {
        assert_eq!(
            extract_amount("Apoyo económico de $13.000.000 por semestre"),
            Some(Amount::new(13_000_000.0, "COP"))
        );
        assert_eq!(
            extract_amount("Financiación hasta 45 millones de pesos"),
            Some(Amount::new(45_000_000.0, "COP"))
        );
        assert_eq!(
            extract_amount("Stipend of USD $2,500.50 per month"),
            Some(Amount::new(2500.5, "USD"))
        );
        assert_eq!(extract_amount("EUR 1.200 mensuales"), Some(Amount::new(1200.0, "EUR")));
        assert_eq!(extract_amount("Cubre matrícula y tiquetes"), None);
    }

    #[test]
    fn requirements_keep_original_casing() {
        let text = "Descripción general.\nRequisitos: Ser colombiano, tener título de Maestría \
                    y certificado de inglés B2.\n\nDocumentos: ...";
        assert_eq!(
            extract_requirements(text).as_deref(),
            Some("Ser colombiano, tener título de Maestría y certificado de inglés B2.")
        );
    }

    #[test]
    fn required_documents_follow_their_heading() {
        let text = "Requisitos: ser docente de planta con doctorado.\n\n\
                    Documentos requeridos: carta de aceptación, hoja de vida y certificado de notas.\n\n\
                    CRONOGRAMA\nCierre 10/10/2025";
        assert_eq!(
            extract_required_documents(text).as_deref(),
            Some("carta de aceptación, hoja de vida y certificado de notas.")
        );
        let extracted = PatternExtractor.extract(text);
        assert_eq!(extracted.requirements.as_deref(), Some("ser docente de planta con doctorado."));
        assert!(extracted.required_documents.is_some());
    }

    #[test]
    fn document_sections_stop_at_caps_headings() {
        let text = "Se debe adjuntar: pasaporte vigente y dos cartas de recomendación\nFECHAS IMPORTANTES\n1 de mayo";
        assert_eq!(
            extract_required_documents(text).as_deref(),
            Some("pasaporte vigente y dos cartas de recomendación")
        );
        assert_eq!(extract_required_documents("Sin anexos."), None);
    }

    #[test]
    fn extractor_reports_unknown_instead_of_failing() {
        let extracted = PatternExtractor.extract("   ");
        assert_eq!(extracted, Extracted::default());
        let extracted = PatternExtractor.extract("Convocatoria abierta. Cierre: 2 de mayo de 2026");
        assert_eq!(extracted.closing_date, Some(date(2026, 5, 2)));
        assert_eq!(extracted.amount, None);
    }
}
