/// Stable key of one source video (the file stem, e.g. `sample3`).
pub type ItemKey = String;

/// Name of a model/configuration whose output is being compared.
pub type ProducerId = String;

/// Identifier of one human rater.
pub type RaterId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
