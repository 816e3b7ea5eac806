/// JSONL batch files written by the upload worker.
pub mod batch_file;
