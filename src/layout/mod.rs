//! Byte placement of fixed and record variables.
//!
//! Fixed variables sit contiguously after the header in declaration order.
//! Record variables follow, interleaved record by record: record `r` of a
//! record variable lives at `begin + r * record_size`.

use crate::catalog::{UNPLACED, Variable};
use crate::error::CdfError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub begin: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layout {
    /// One entry per input variable, in input order.
    pub placements: Vec<Placement>,
    pub begin_record_region: u64,
    pub record_size: u64,
}

fn advance(cursor: u64, var: &Variable) -> Result<u64, CdfError> {
    cursor.checked_add(var.len()).ok_or_else(|| {
        CdfError::InvalidArgument(format!(
            "variable '{}' does not fit in the file's address space",
            var.name()
        ))
    })
}

/// Place every variable after a header of `header_len` bytes.
///
/// When the record variables' lengths sum to the last record variable's own
/// length, records are packed at that variable's unpadded instance size.
/// Fails if an offset would not fit in a `u64`.
pub fn compute_layout(vars: &[Variable], header_len: u64) -> Result<Layout, CdfError> {
    let mut placements = vec![Placement { begin: 0, len: 0 }; vars.len()];
    let mut cursor = header_len;

    for (idx, var) in vars.iter().enumerate() {
        if var.is_record() {
            continue;
        }
        placements[idx] = Placement {
            begin: cursor,
            len: var.len(),
        };
        cursor = advance(cursor, var)?;
    }

    let begin_record_region = cursor;
    let mut record_size = 0;
    let mut last = None;
    for (idx, var) in vars.iter().enumerate() {
        if !var.is_record() {
            continue;
        }
        placements[idx] = Placement {
            begin: cursor,
            len: var.len(),
        };
        cursor = advance(cursor, var)?;
        record_size = advance(record_size, var)?;
        last = Some(var);
    }

    Ok(Layout {
        placements,
        begin_record_region,
        record_size: packed_record_size(record_size, last),
    })
}

fn packed_record_size(sum: u64, last: Option<&Variable>) -> u64 {
    match last {
        Some(var) if sum == var.len() => var.instance_bytes(),
        _ => sum,
    }
}

/// Record size of variables whose offsets are already fixed, e.g. after decoding a header.
pub fn record_size_of(vars: &[Variable]) -> u64 {
    let mut sum = 0;
    let mut last = None;
    for var in vars.iter().filter(|v| v.is_record()) {
        sum = var.len().saturating_add(sum);
        last = Some(var);
    }
    packed_record_size(sum, last)
}

/// Start of the record region for already placed variables.
pub fn begin_record_region_of(vars: &[Variable], header_len: u64) -> u64 {
    let first_record = vars.iter().filter(|v| v.is_record()).map(Variable::begin).min();
    let end_of_fixed = vars
        .iter()
        .filter(|v| !v.is_record())
        .map(|v| v.begin().saturating_add(v.len()))
        .max();
    first_record
        .or(end_of_fixed)
        .unwrap_or(header_len)
}

/// Bytes one record of `var` occupies inside a record of `record_size` bytes.
pub fn record_span(var: &Variable, record_size: u64) -> u64 {
    var.len().min(record_size)
}

/// Append-only placement for files whose header lives in a fixed reserve.
///
/// Variables that already have an offset keep it. Unplaced fixed variables are
/// appended after `max(reserve, end of placed data)`. Record variables are not
/// supported by this placement.
pub fn append_layout(vars: &[Variable], reserve: u64) -> Result<Layout, CdfError> {
    if let Some(var) = vars.iter().find(|v| v.is_record()) {
        return Err(CdfError::InvalidArgument(format!(
            "record variable '{}' cannot be placed in a container file",
            var.name()
        )));
    }
    let mut cursor = reserve;
    for var in vars.iter().filter(|v| v.begin() != UNPLACED) {
        cursor = cursor.max(advance(var.begin(), var)?);
    }
    let mut placements = Vec::with_capacity(vars.len());
    for var in vars {
        if var.is_placed() {
            placements.push(Placement {
                begin: var.begin(),
                len: var.len(),
            });
        } else {
            placements.push(Placement {
                begin: cursor,
                len: var.len(),
            });
            cursor = advance(cursor, var)?;
        }
    }
    Ok(Layout {
        placements,
        begin_record_region: cursor,
        record_size: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::{append_layout, compute_layout, record_size_of, record_span};
    use crate::catalog::{NcType, Schema};
    use crate::error::CdfError;
    use proptest::prelude::*;

    fn schema_with(vars: &[(&str, NcType, &[&str])]) -> Schema {
        let mut schema = Schema::default();
        schema.add_dimension("rec", None).expect("rec");
        schema.add_dimension("x", Some(3)).expect("x");
        schema.add_dimension("y", Some(7)).expect("y");
        for (name, ty, dims) in vars {
            schema.add_variable(name, *ty, dims).expect("var");
        }
        schema
    }

    fn place(schema: &mut Schema, header_len: u64) -> super::Layout {
        let layout = compute_layout(schema.variables(), header_len).expect("layout");
        for (idx, p) in layout.placements.iter().enumerate() {
            schema.set_begin(idx, p.begin);
        }
        layout
    }

    #[test]
    fn fixed_then_record_in_declaration_order() {
        let schema = schema_with(&[
            ("r1", NcType::Int, &["rec", "x"]),
            ("f1", NcType::Short, &["y"]),
            ("r2", NcType::Byte, &["rec"]),
            ("f2", NcType::Double, &["x"]),
        ]);
        let layout = compute_layout(schema.variables(), 100).expect("layout");
        let begins: Vec<u64> = layout.placements.iter().map(|p| p.begin).collect();
        // f1: 14 bytes padded to 16, f2: 24 bytes.
        assert_eq!(begins, vec![140, 100, 152, 116]);
        assert_eq!(layout.begin_record_region, 140);
        assert_eq!(layout.record_size, 12 + 4);
    }

    #[test]
    fn lone_record_variable_is_packed_unpadded() {
        let schema = schema_with(&[("f", NcType::Int, &["x"]), ("r", NcType::Short, &["rec"])]);
        let layout = compute_layout(schema.variables(), 32).expect("layout");
        assert_eq!(schema.variables()[1].len(), 4);
        assert_eq!(layout.record_size, 2);
        assert_eq!(record_span(&schema.variables()[1], layout.record_size), 2);
    }

    #[test]
    fn several_record_variables_are_not_packed() {
        let mut schema = Schema::default();
        schema.add_dimension("rec", None).expect("rec");
        schema.add_variable("a", NcType::Byte, &["rec"]).expect("a");
        schema.add_variable("b", NcType::Byte, &["rec"]).expect("b");
        let layout = compute_layout(schema.variables(), 0).expect("layout");
        assert_eq!(layout.record_size, 8);
    }

    #[test]
    fn no_record_variables_means_zero_record_size() {
        let schema = schema_with(&[("f", NcType::Float, &["x", "y"])]);
        let layout = compute_layout(schema.variables(), 8).expect("layout");
        assert_eq!(layout.record_size, 0);
        assert_eq!(layout.begin_record_region, 8 + 84);
    }

    #[test]
    fn record_size_recomputed_from_placed_variables() {
        let mut schema = schema_with(&[
            ("r1", NcType::Int, &["rec", "x"]),
            ("r2", NcType::Byte, &["rec"]),
        ]);
        let layout = place(&mut schema, 64);
        assert_eq!(record_size_of(schema.variables()), layout.record_size);
        assert_eq!(
            super::begin_record_region_of(schema.variables(), 64),
            layout.begin_record_region
        );
    }

    #[test]
    fn append_layout_keeps_placed_and_appends_new() {
        let mut schema = schema_with(&[("a", NcType::Int, &["x"])]);
        schema.set_begin(0, 4096);
        schema.add_variable("b", NcType::Short, &["y"]).expect("b");
        let layout = append_layout(schema.variables(), 4096).expect("append");
        assert_eq!(layout.placements[0].begin, 4096);
        assert_eq!(layout.placements[1].begin, 4096 + 12);

        schema.add_variable("r", NcType::Int, &["rec"]).expect("r");
        assert!(append_layout(schema.variables(), 4096).is_err());
    }

    #[test]
    fn offsets_past_u64_are_rejected() {
        let mut schema = Schema::default();
        schema.add_dimension("a", Some(1 << 31)).expect("a");
        schema.add_dimension("b", Some(1 << 31)).expect("b");
        schema.add_dimension("c", Some(2)).expect("c");
        schema.add_variable("x", NcType::Byte, &["a", "b", "c"]).expect("x");
        schema.add_variable("y", NcType::Byte, &["a", "b", "c"]).expect("y");
        assert!(matches!(
            compute_layout(schema.variables(), 64),
            Err(CdfError::InvalidArgument(_))
        ));

        schema.set_begin(0, 4096);
        assert!(matches!(
            append_layout(schema.variables(), 4096),
            Err(CdfError::InvalidArgument(_))
        ));
    }

    proptest! {
        #[test]
        fn layout_is_pure_and_non_overlapping(
            shapes in proptest::collection::vec((any::<bool>(), 1u64..40, 0usize..6), 0..12),
            header_len in 0u64..512,
        ) {
            let types = [NcType::Byte, NcType::Char, NcType::Short, NcType::Int, NcType::Float, NcType::Double];
            let mut schema = Schema::default();
            schema.add_dimension("rec", None).expect("rec");
            for (idx, (is_record, size, ty)) in shapes.iter().enumerate() {
                let dim = format!("d{idx}");
                schema.add_dimension(&dim, Some(*size)).expect("dim");
                let dims: Vec<&str> = if *is_record { vec!["rec", dim.as_str()] } else { vec![dim.as_str()] };
                schema.add_variable(&format!("v{idx}"), types[*ty], &dims).expect("var");
            }

            let first = compute_layout(schema.variables(), header_len).expect("layout");
            let second = compute_layout(schema.variables(), header_len).expect("layout");
            prop_assert_eq!(&first, &second);

            let mut fixed: Vec<(u64, u64)> = Vec::new();
            for (var, p) in schema.variables().iter().zip(&first.placements) {
                prop_assert!(p.begin >= header_len);
                prop_assert_eq!(p.begin % 4, header_len % 4);
                if !var.is_record() {
                    prop_assert!(p.begin + p.len <= first.begin_record_region);
                    fixed.push((p.begin, p.begin + p.len));
                } else {
                    prop_assert!(p.begin >= first.begin_record_region);
                }
            }
            fixed.sort_unstable();
            for pair in fixed.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0);
            }
            let records = schema.record_variable_count();
            if records == 1 {
                let var = schema.variables().iter().find(|v| v.is_record()).expect("record var");
                prop_assert_eq!(first.record_size, var.instance_bytes());
            }
        }
    }
}
