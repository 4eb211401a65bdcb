//! RecordBatch manipulation shared by the writer: primary-key sort (I4) and
//! splitting a batch into per-partition groups before serialization.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use datafusion::arrow::array::{Array, RecordBatch, StringArray};
use datafusion::arrow::compute::{lexsort_to_indices, take, SortColumn};
use datafusion::arrow::datatypes::{DataType, Field, Schema};

/// Columns declared by the schema but absent from the batch (spec §4.C
/// `SchemaMismatch`).
pub fn missing_columns(schema: &Schema, columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .filter(|c| schema.column_with_name(c).is_none())
        .cloned()
        .collect()
}

/// Appends a `year` column derived from the first four characters of
/// `date_col` (spec §4.I "derives a `year` column from the date column").
/// `date_col` values are assumed to be `YYYYMMDD` strings per spec §3.
pub fn derive_year_column(batch: &RecordBatch, date_col: &str) -> Result<RecordBatch> {
    let idx = batch
        .schema()
        .index_of(date_col)
        .with_context(|| format!("date column {date_col} absent from batch"))?;
    let dates = batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("date column {date_col} is not a UTF-8 column"))?;

    let years: StringArray = dates
        .iter()
        .map(|value| value.map(|s| s.get(0..4).unwrap_or(s)))
        .collect();

    let mut fields: Vec<Arc<Field>> = batch.schema().fields().iter().cloned().collect();
    fields.push(Arc::new(Field::new("year", DataType::Utf8, false)));
    let schema = Arc::new(Schema::new(fields));

    let mut columns = batch.columns().to_vec();
    columns.push(Arc::new(years));
    RecordBatch::try_new(schema, columns).context("appending derived year column")
}

/// Sorts `batch` by `primary_key`, ascending, nulls first — the writer's
/// responsibility per spec §4.C. Ties are stable: rows are reordered only to
/// the extent the sort keys require.
pub fn sort_by_primary_key(batch: &RecordBatch, primary_key: &[String]) -> Result<RecordBatch> {
    let missing = missing_columns(batch.schema().as_ref(), primary_key);
    if !missing.is_empty() {
        bail!("batch is missing primary key column(s): {missing:?}");
    }

    let sort_columns: Vec<SortColumn> = primary_key
        .iter()
        .map(|col| {
            let idx = batch.schema().index_of(col).expect("checked above");
            SortColumn {
                values: Arc::clone(batch.column(idx)),
                options: None,
            }
        })
        .collect();

    let indices = lexsort_to_indices(&sort_columns, None).context("sorting batch by primary key")?;
    let columns = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &indices, None).map_err(Into::into))
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(batch.schema(), columns).context("rebuilding sorted batch")
}

/// Splits `batch` into one sub-batch per distinct combination of
/// `partition_cols` values, each tagged with the path suffix
/// (`col=value/col2=value2`) it belongs under. `partition_cols` values are
/// assumed to be UTF-8 (spec's only partition column, `year`, is derived as
/// a string). An empty `partition_cols` yields a single group with an empty
/// suffix.
pub fn split_by_partition(
    batch: &RecordBatch,
    partition_cols: &[String],
) -> Result<Vec<(String, RecordBatch)>> {
    if partition_cols.is_empty() {
        return Ok(vec![(String::new(), batch.clone())]);
    }

    let missing = missing_columns(batch.schema().as_ref(), partition_cols);
    if !missing.is_empty() {
        bail!("batch is missing partition column(s): {missing:?}");
    }

    let columns: Vec<&StringArray> = partition_cols
        .iter()
        .map(|col| {
            let idx = batch.schema().index_of(col).expect("checked above");
            batch
                .column(idx)
                .as_any()
                .downcast_ref::<StringArray>()
                .with_context(|| format!("partition column {col} is not a UTF-8 column"))
        })
        .collect::<Result<_>>()?;

    let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let key = partition_cols
            .iter()
            .zip(columns.iter())
            .map(|(col, array)| format!("{col}={}", array.value(row)))
            .collect::<Vec<_>>()
            .join("/");
        groups.entry(key).or_default().push(row as u32);
    }

    groups
        .into_iter()
        .map(|(key, rows)| {
            let indices = datafusion::arrow::array::UInt32Array::from(rows);
            let columns = batch
                .columns()
                .iter()
                .map(|c| take(c.as_ref(), &indices, None).map_err(Into::into))
                .collect::<Result<Vec<_>>>()?;
            let sub = RecordBatch::try_new(batch.schema(), columns)?;
            Ok((key, sub))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{DataType, Field};

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("symbol", DataType::Utf8, false),
            Field::new("trade_date", DataType::Utf8, false),
            Field::new("year", DataType::Utf8, false),
            Field::new("close", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["B", "A", "A"])),
                Arc::new(StringArray::from(vec!["19901219", "19901220", "19901219"])),
                Arc::new(StringArray::from(vec!["1990", "1990", "1990"])),
                Arc::new(Int64Array::from(vec![Some(20), Some(11), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn sorts_by_primary_key() {
        let batch = sample_batch();
        let sorted = sort_by_primary_key(&batch, &["symbol".to_string(), "trade_date".to_string()]).unwrap();
        let symbols = sorted
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(symbols.value(0), "A");
        assert_eq!(symbols.value(1), "A");
        assert_eq!(symbols.value(2), "B");
        let dates = sorted
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(dates.value(0), "19901219");
        assert_eq!(dates.value(1), "19901220");
    }

    #[test]
    fn rejects_batch_missing_primary_key_column() {
        let batch = sample_batch();
        let err = sort_by_primary_key(&batch, &["does_not_exist".to_string()]).unwrap_err();
        assert!(err.to_string().contains("does_not_exist"));
    }

    #[test]
    fn splits_by_partition_column() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("year", DataType::Utf8, false),
            Field::new("v", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["1990", "1991", "1990"])),
                Arc::new(Int64Array::from(vec![1, 2, 3])),
            ],
        )
        .unwrap();

        let groups = split_by_partition(&batch, &["year".to_string()]).unwrap();
        assert_eq!(groups.len(), 2);
        let group_1990 = groups.iter().find(|(k, _)| k == "year=1990").unwrap();
        assert_eq!(group_1990.1.num_rows(), 2);
    }

    #[test]
    fn no_partition_columns_yields_single_group() {
        let batch = sample_batch();
        let groups = split_by_partition(&batch, &[]).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, "");
        assert_eq!(groups[0].1.num_rows(), 3);
    }

    fn batch_without_year_column() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("symbol", DataType::Utf8, false),
            Field::new("trade_date", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["A", "B"])),
                Arc::new(StringArray::from(vec!["19901219", "19911220"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn derives_year_from_yyyymmdd_date_column() {
        let batch = batch_without_year_column();
        let with_year = derive_year_column(&batch, "trade_date").unwrap();
        let year_idx = with_year.schema().index_of("year").unwrap();
        let years = with_year.column(year_idx).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(years.value(0), "1990");
        assert_eq!(years.value(1), "1991");
        assert_eq!(with_year.num_rows(), batch.num_rows());
    }

    #[test]
    fn derive_year_column_rejects_missing_date_column() {
        let batch = batch_without_year_column();
        let err = derive_year_column(&batch, "does_not_exist").unwrap_err();
        assert!(err.to_string().contains("does_not_exist"));
    }
}
