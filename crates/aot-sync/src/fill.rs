use aot_adapters::FieldExtractor;
use aot_core::RawCandidate;
use tracing::debug;

/// Fill fields the adapter left unknown from the candidate's own text.
/// Values the adapter supplied are never replaced.
pub fn fill_candidates(extractor: &dyn FieldExtractor, candidates: &mut [RawCandidate]) {
    for candidate in candidates.iter_mut() {
        let text = match candidate.description.as_deref() {
            Some(description) if !candidate.context_text.contains(description) => {
                format!("{description}\n\n{}", candidate.context_text)
            }
            _ => candidate.context_text.clone(),
        };
        if text.trim().is_empty() {
            continue;
        }
        let extracted = extractor.extract(&text);
        let mut filled = Vec::new();
        if candidate.closing_date.is_none() && extracted.closing_date.is_some() {
            candidate.closing_date = extracted.closing_date;
            filled.push("closing_date");
        }
        if candidate.opening_date.is_none() && extracted.opening_date.is_some() {
            candidate.opening_date = extracted.opening_date;
            filled.push("opening_date");
        }
        if candidate.amount.is_none() && extracted.amount.is_some() {
            candidate.amount = extracted.amount;
            filled.push("amount");
        }
        if candidate.requirements.is_none() && extracted.requirements.is_some() {
            candidate.requirements = extracted.requirements;
            filled.push("requirements");
        }
        if candidate.required_documents.is_none() && extracted.required_documents.is_some() {
            candidate.required_documents = extracted.required_documents;
            filled.push("required_documents");
        }
        if !filled.is_empty() {
            debug!(source_id = %candidate.source_id, name = %candidate.name, ?filled, "fields extracted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aot_adapters::PatternExtractor;
    use aot_core::Amount;
    use chrono::{NaiveDate, Utc};

    #[test]
    fn only_unknown_fields_are_filled() {
        let mut known = RawCandidate::new("icetex", "Beca A", "ICETEX", Utc::now());
        known.closing_date = NaiveDate::from_ymd_opt(2025, 1, 31);
        known.context_text = "Cierre: 15 de marzo de 2025. Apoyo de $2.500.000".into();

        let mut blank = RawCandidate::new("icetex", "Beca B", "ICETEX", Utc::now());
        blank.description = Some("Fecha límite 10/04/2025".into());

        let mut candidates = vec![known, blank];
        fill_candidates(&PatternExtractor, &mut candidates);

        assert_eq!(candidates[0].closing_date, NaiveDate::from_ymd_opt(2025, 1, 31));
        assert_eq!(candidates[0].amount, Some(Amount::new(2_500_000.0, "COP")));
        assert_eq!(candidates[1].closing_date, NaiveDate::from_ymd_opt(2025, 4, 10));
        assert_eq!(candidates[1].amount, None);
    }

    #[test]
    fn required_documents_are_filled_from_description() {
        let mut c = RawCandidate::new("minciencias", "Convocatoria Doctorados", "Minciencias", Utc::now());
        c.description = Some("Documentos a presentar: certificado laboral y propuesta de investigación".into());
        c.required_documents = None;
        let mut candidates = vec![c];
        fill_candidates(&PatternExtractor, &mut candidates);
        assert_eq!(
            candidates[0].required_documents.as_deref(),
            Some("certificado laboral y propuesta de investigación")
        );
    }
}
