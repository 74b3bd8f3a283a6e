use serde::{Deserialize, Serialize};

/// Processing pipelines a batch can require and a processor job can apply.
///
/// Stored as the SCREAMING_SNAKE_CASE tag (`AFFY_TO_PCL`, `NO_OP`, ...).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineName {
    AffyToPcl,
    Salmon,
    TranscriptomeIndexLong,
    TranscriptomeIndexShort,
    NoOp,
}

/// Downloader implementations a downloader job can be bound to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloaderTask {
    ArrayExpress,
    Sra,
    TranscriptomeIndex,
}
