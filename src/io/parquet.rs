//! Saving chains as ZSTD-compressed Parquet. Enable via the `parquet` feature.

use arrow::{
    array::{ArrayRef, Float64Builder, UInt32Builder},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use ndarray::Axis;
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use std::error::Error;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::chain::StepArray;

/// Saves a `[step, chain, parameter]` array as a Parquet file with the columns
/// `step` (UInt32), `chain` (UInt32) and one Float64 column per parameter name.
///
/// # Examples
///
/// ```rust
/// use simplified_mc::io::parquet::save_parquet;
/// use ndarray::arr3;
///
/// let steps = arr3(&[[[1.0], [2.0]]]); // 1 step, 2 chains, 1 parameter
/// let file = tempfile::NamedTempFile::new()?;
/// save_parquet(&steps, &["mu".to_string()], file.path())?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn save_parquet(steps: &StepArray, names: &[String], filename: impl AsRef<Path>) -> Result<(), Box<dyn Error>> {
    let (n_steps, n_chains, n_dims) = steps.dim();
    if names.len() != n_dims {
        return Err(format!("Got {} names for {} parameters", names.len(), n_dims).into());
    }

    let mut fields = vec![
        Field::new("step", DataType::UInt32, false),
        Field::new("chain", DataType::UInt32, false),
    ];
    fields.extend(
        names
            .iter()
            .map(|name| Field::new(name.as_str(), DataType::Float64, false)),
    );
    let schema = Arc::new(Schema::new(fields));

    let n_rows = n_steps * n_chains;
    let mut step_builder = UInt32Builder::with_capacity(n_rows);
    let mut chain_builder = UInt32Builder::with_capacity(n_rows);
    let mut dim_builders: Vec<Float64Builder> =
        (0..n_dims).map(|_| Float64Builder::with_capacity(n_rows)).collect();

    for (step_idx, step) in steps.axis_iter(Axis(0)).enumerate() {
        for (chain_idx, state) in step.axis_iter(Axis(0)).enumerate() {
            step_builder.append_value(step_idx as u32);
            chain_builder.append_value(chain_idx as u32);
            for (builder, &val) in dim_builders.iter_mut().zip(state.iter()) {
                builder.append_value(val);
            }
        }
    }

    let mut arrays = vec![
        Arc::new(step_builder.finish()) as ArrayRef,
        Arc::new(chain_builder.finish()) as ArrayRef,
    ];
    arrays.extend(
        dim_builders
            .iter_mut()
            .map(|builder| Arc::new(builder.finish()) as ArrayRef),
    );
    let record_batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let file = File::create(filename)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;

    writer.write(&record_batch)?;
    // Close the writer to ensure metadata is written
    writer.close()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, UInt32Array};
    use ndarray::arr3;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReader;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use tempfile::NamedTempFile;

    #[test]
    fn test_save_parquet_multi_chain() -> Result<(), Box<dyn Error>> {
        // steps[step][chain][dim]
        let data = arr3(&[[[1.0, 2.0], [10.0, 20.0]], [[3.0, 4.0], [30.0, 40.0]]]);
        let names = vec!["mu".to_string(), "sigma".to_string()];

        let file = NamedTempFile::new()?;
        save_parquet(&data, &names, file.path())?;

        let mut reader = ParquetRecordBatchReader::try_new(File::open(file.path())?, 1024)?;
        let batch = reader.next().expect("No record batch found")?;
        assert!(reader.next().is_none(), "Expected only one batch");

        assert_eq!(batch.num_rows(), 4);
        assert_eq!(batch.num_columns(), 4);
        assert_eq!(batch.schema().field(2).name(), "mu");
        assert_eq!(batch.schema().field(3).name(), "sigma");

        let steps = batch
            .column(0)
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap();
        let chains = batch
            .column(1)
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap();
        let mu = batch
            .column(2)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();

        assert_eq!(steps.values().to_vec(), vec![0, 0, 1, 1]);
        assert_eq!(chains.values().to_vec(), vec![0, 1, 0, 1]);
        assert_eq!(mu.values().to_vec(), vec![1.0, 10.0, 3.0, 30.0]);
        Ok(())
    }

    #[test]
    fn test_save_parquet_is_zstd_compressed() -> Result<(), Box<dyn Error>> {
        let data = arr3(&[[[1.0]], [[2.0]]]);
        let file = NamedTempFile::new()?;
        save_parquet(&data, &["x".to_string()], file.path())?;

        let reader = SerializedFileReader::new(File::open(file.path())?)?;
        let column = reader.metadata().row_group(0).column(2).compression();
        assert!(matches!(column, Compression::ZSTD(_)));
        Ok(())
    }

    #[test]
    fn test_save_parquet_rejects_wrong_names() {
        let data = arr3(&[[[1.0, 2.0]]]);
        let file = NamedTempFile::new().expect("Could not create temp file");
        assert!(save_parquet(&data, &[], file.path()).is_err());
    }
}
