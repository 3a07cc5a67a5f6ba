//! Moves variable data from an original file into its redefined shadow.

use crate::codec::{CodecGateway, EncodedStream};
use crate::error::CdfError;
use crate::handle::{FillMode, Handle};
use crate::layout::record_span;

/// Copy `n` bytes between the current positions of two streams using `buf` as
/// the only intermediate storage.
pub fn copy_bytes(
    target: &mut EncodedStream,
    source: &mut EncodedStream,
    n: u64,
    buf: &mut [u8],
) -> Result<(), CdfError> {
    if buf.is_empty() && n > 0 {
        return Err(CdfError::InvalidArgument("copy buffer is empty".into()));
    }
    let mut remaining = n;
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        source.read_exact(&mut buf[..chunk])?;
        target.write_all(&buf[..chunk])?;
        remaining -= chunk as u64;
    }
    Ok(())
}

/// Copy the whole of a fixed variable of `source` to the target's current position.
pub fn copy_variable(
    target: &mut EncodedStream,
    source: &mut Handle,
    var_index: usize,
    buf: &mut [u8],
) -> Result<(), CdfError> {
    let (begin, len) = {
        let var = &source.schema.variables()[var_index];
        (var.begin(), var.len())
    };
    source.stream.seek(begin)?;
    copy_bytes(target, &mut source.stream, len, buf)
}

fn record_at(begin: u64, record_size: u64, record: u64) -> Result<u64, CdfError> {
    record_size
        .checked_mul(record)
        .and_then(|skip| skip.checked_add(begin))
        .ok_or_else(|| CdfError::CodecFault(format!("record {record} offset overflows")))
}

/// Copy `span` bytes of one record of a record variable of `source`.
pub fn copy_record(
    target: &mut EncodedStream,
    source: &mut Handle,
    var_index: usize,
    record: u64,
    span: u64,
    buf: &mut [u8],
) -> Result<(), CdfError> {
    let begin = source.schema.variables()[var_index].begin();
    source
        .stream
        .seek(record_at(begin, source.record_size, record)?)?;
    copy_bytes(target, &mut source.stream, span, buf)
}

/// Fill a freshly laid out shadow from the original.
///
/// Variables are matched by id. A match whose storage shape is unchanged is
/// copied byte for byte; anything else gets the fill pattern unless the shadow
/// is in no-fill mode. Fixed variables go first, then every record of the
/// original in order.
pub(crate) fn populate_from(
    shadow: &mut Handle,
    original: &mut Handle,
    codec: &dyn CodecGateway,
    buf: &mut [u8],
) -> Result<(), CdfError> {
    let fill = shadow.fill_mode() == FillMode::Fill;
    let Handle {
        schema,
        stream: target,
        record_size,
        ..
    } = shadow;
    let record_size = *record_size;

    for var in schema.variables().iter().filter(|v| !v.is_record()) {
        let matched = original
            .schema
            .variable_by_id(var.id())
            .filter(|(_, old)| old.same_storage(var))
            .map(|(idx, _)| idx);
        target.seek(var.begin())?;
        match matched {
            Some(idx) => copy_variable(target, original, idx, buf)?,
            None if fill => codec.write_fill(target, var, var.len())?,
            None => {}
        }
    }

    let record_vars: Vec<_> = schema
        .variables()
        .iter()
        .filter(|v| v.is_record())
        .map(|var| {
            let matched = original
                .schema
                .variable_by_id(var.id())
                .filter(|(_, old)| old.same_storage(var))
                .map(|(idx, old)| (idx, record_span(old, original.record_size)));
            (var, record_span(var, record_size), matched)
        })
        .collect();

    for record in 0..original.num_records {
        for (var, span, matched) in &record_vars {
            target.seek(record_at(var.begin(), record_size, record)?)?;
            match matched {
                Some((idx, src_span)) => {
                    let n = (*span).min(*src_span);
                    copy_record(target, original, *idx, record, n, buf)?;
                    if n < *span {
                        target.write_all(&vec![0u8; (*span - n) as usize])?;
                    }
                }
                None if fill => codec.write_fill(target, var, *span)?,
                None => {}
            }
        }
    }
    Ok(())
}
