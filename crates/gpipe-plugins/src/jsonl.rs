//! JSON Lines loader
//!
//! Streams a `.jsonl` file in batches and inserts each record into one
//! JSONB column of a target table. Both checkpoint forms are honored during
//! extraction: `line=N` drops the first N input lines, `id=V` drops
//! everything up to and including the record whose id field equals `V`.
//! An id that never matches consumes the whole file and loads nothing.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};
use tracing::debug;

use gpipe_engine::{
    BatchStream, Checkpoint, LoadContext, Operation, Plugin, PluginError, PluginResult, Record,
    RecordBatch, TaskContext,
};

pub const DEFAULT_BATCH_SIZE: usize = 500;

pub struct JsonlLoader {
    id_field: String,
    insert_sql: Option<String>,
}

impl JsonlLoader {
    pub fn new() -> Self {
        Self { id_field: "id".to_string(), insert_sql: None }
    }
}

impl Default for JsonlLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for JsonlLoader {
    fn name(&self) -> &str {
        "jsonl-loader"
    }

    fn operation(&self) -> Operation {
        Operation::Insert
    }

    fn streaming(&self) -> bool {
        true
    }

    fn description(&self) -> PluginResult<String> {
        Ok("loads a JSON Lines file into one JSONB column of a table".to_string())
    }

    fn parameter_model(&self) -> PluginResult<Value> {
        Ok(json!({
            "file": "path to the .jsonl input (required)",
            "table": "target table name (required)",
            "column": "target JSONB column, default `data`",
            "batch_size": "records per batch, default 500",
            "id_field": "record field used for id= checkpoints, default `id`",
        }))
    }

    fn affected_tables(&self) -> PluginResult<Vec<String>> {
        // the target table is a task param, not a plugin constant
        Ok(vec![])
    }

    fn record_id(&self, record: &Record) -> Option<String> {
        field_as_id(record, &self.id_field)
    }

    async fn extract(&mut self, ctx: &TaskContext) -> PluginResult<BatchStream> {
        let path = PathBuf::from(ctx.require_str("file")?);
        let table = ctx.require_str("table")?;
        let column = ctx.param_str("column").unwrap_or("data");
        require_identifier("table", table)?;
        require_identifier("column", column)?;
        self.insert_sql = Some(format!("INSERT INTO {table} ({column}) VALUES ($1)"));

        if let Some(field) = ctx.param_str("id_field") {
            self.id_field = field.to_string();
        }
        let batch_size = ctx
            .param_u64("batch_size")?
            .unwrap_or(DEFAULT_BATCH_SIZE as u64)
            .max(1) as usize;

        let (skip_lines, skip_until_id) = match &ctx.checkpoint {
            Some(Checkpoint::Line(n)) => (*n, None),
            Some(Checkpoint::Id(id)) => (0, Some(id.clone())),
            None => (0, None),
        };
        if skip_lines > 0 || skip_until_id.is_some() {
            debug!(
                "{} resuming {} from checkpoint",
                ctx.qualified_name(),
                path.display()
            );
        }

        let file = File::open(&path)
            .map_err(|e| PluginError::message(format!("cannot open {}: {e}", path.display())))?;
        let batches = BatchIter {
            lines: BufReader::new(file).lines(),
            batch_size,
            line_number: 0,
            skip_lines,
            skip_until_id,
            id_field: self.id_field.clone(),
        };
        Ok(Box::pin(stream::iter(batches)))
    }

    async fn load(&mut self, batch: RecordBatch, ctx: &mut LoadContext<'_>) -> PluginResult<u64> {
        let sql = self
            .insert_sql
            .clone()
            .ok_or_else(|| PluginError::message("extract must run before load"))?;
        for record in &batch {
            ctx.execute(&sql, &[record.clone()]).await?;
            ctx.track(1, "records").await?;
        }
        Ok(batch.len() as u64)
    }
}

/// Lazily reads the file, one batch per `next` call
struct BatchIter {
    lines: Lines<BufReader<File>>,
    batch_size: usize,
    /// 1-based count of input lines consumed, blank lines included
    line_number: u64,
    skip_lines: u64,
    skip_until_id: Option<String>,
    id_field: String,
}

impl Iterator for BatchIter {
    type Item = PluginResult<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let Some(line) = self.lines.next() else { break };
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(PluginError::Io(e))),
            };
            self.line_number += 1;
            if self.line_number <= self.skip_lines {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            let record: Value = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    return Some(Err(PluginError::message(format!(
                        "line {}: {e}",
                        self.line_number
                    ))))
                },
            };

            if let Some(target) = &self.skip_until_id {
                if field_as_id(&record, &self.id_field).as_deref() == Some(target.as_str()) {
                    self.skip_until_id = None;
                }
                continue;
            }
            batch.push(record);
        }

        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

fn field_as_id(record: &Record, field: &str) -> Option<String> {
    match record.get(field) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn require_identifier(what: &str, value: &str) -> PluginResult<()> {
    if value.is_empty()
        || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(PluginError::invalid_param(
            what,
            format!("'{value}' is not a valid identifier"),
        ));
    }
    Ok(())
}
