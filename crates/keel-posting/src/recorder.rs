use keel_types::decision::DECISION_LOG_VERSION;
use keel_types::DecisionRecord;

/// In-flight decision journal for one posting.
///
/// Records are appended in pipeline order and persisted on the outcome,
/// for successful and failed postings alike. Each append also emits a
/// tracing event so live logs and the durable journal tell the same story.
#[derive(Debug, Default)]
pub struct DecisionJournal {
    records: Vec<DecisionRecord>,
}

impl DecisionJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue an existing journal, e.g. when abandoning a failed outcome
    /// whose earlier records must survive.
    pub fn from_records(records: Vec<DecisionRecord>) -> Self {
        Self { records }
    }

    pub fn record(&mut self, record: DecisionRecord) {
        if let Ok(line) = serde_json::to_string(&record) {
            tracing::info!(
                target: "keel::decision",
                version = DECISION_LOG_VERSION,
                record = %line,
                "decision"
            );
        }
        self.records.push(record);
    }

    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<DecisionRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_in_order() {
        let mut journal = DecisionJournal::new();
        journal.record(DecisionRecord::MeaningFormed {
            economic_type: "INVENTORY_INCREASE".to_string(),
        });
        journal.record(DecisionRecord::SequenceAllocated {
            name: "journal_entry_seq".to_string(),
            value: 1,
        });

        assert_eq!(journal.records().len(), 2);
        assert!(matches!(
            journal.records()[0],
            DecisionRecord::MeaningFormed { .. }
        ));
    }
}
