/*
 * Copyright 2020 Joyent, Inc.
 */

//! Server-side post-processing of a Data Block before transmission.

use crate::blocks::ClientBlock;
use crate::types::{decode_f64, encode_f64, DataBlock, DataType, Dim, DimCompression};

/// Apply the transforms requested by `client`. Returns an error message when a
/// compressed dimension cannot be cast.
pub fn post_process(
    client: &ClientBlock,
    block: &mut DataBlock,
) -> Result<(), String> {
    if client.get_scalar && block.rank == 1 {
        reduce_rank(block);
    }
    if client.get_timedble || client.get_dimdble {
        cast_dims(client, block)?;
    }
    Ok(())
}

/// Collapse a rank-1 block to a scalar when its only dimension is compressed
/// and every coordinate is zero.
pub fn reduce_rank(block: &mut DataBlock) -> bool {
    let reducible = match block.dims.first() {
        Some(dim) if dim.is_compressed() => all_zero(dim),
        _ => false,
    };
    if reducible {
        block.order = -1;
        block.rank = 0;
        block.dims.clear();
    }
    reducible
}

fn all_zero(dim: &Dim) -> bool {
    match &dim.compression {
        DimCompression::None => false,
        DimCompression::Regular { start, step } => *start == 0.0 && *step == 0.0,
        DimCompression::Domains { sams, offs, ints } => {
            match (decode_f64(dim.data_type, offs), decode_f64(dim.data_type, ints)) {
                (Some(offs), Some(ints)) => sams
                    .iter()
                    .zip(offs.iter().zip(ints.iter()))
                    .all(|(n, (o, i))| *n == 0 || (*o == 0.0 && (*n == 1 || *i == 0.0))),
                _ => false,
            }
        }
        DimCompression::Offsets { offs } => decode_f64(dim.data_type, offs)
            .map_or(false, |offs| offs.iter().all(|v| *v == 0.0)),
        DimCompression::Periodic { offs, ints, udoms } => {
            match (decode_f64(dim.data_type, offs), decode_f64(dim.data_type, ints)) {
                (Some(offs), Some(ints)) => match (offs.first(), ints.first()) {
                    (Some(o), Some(i)) => *o == 0.0 && (*udoms <= 1 || *i == 0.0),
                    _ => false,
                },
                _ => false,
            }
        }
    }
}

/// Cast compressed dimensions to double precision: only the ordering
/// dimension when the client asked for a double time axis, otherwise all.
pub fn cast_dims(client: &ClientBlock, block: &mut DataBlock) -> Result<(), String> {
    let order = block.order;
    for (k, dim) in block.dims.iter_mut().enumerate() {
        if client.get_timedble && k as i32 != order {
            continue;
        }
        if dim.is_compressed() {
            cast_dim(dim).map_err(|e| format!("dimension {}: {}", k, e))?;
        }
    }
    Ok(())
}

fn cast_dim(dim: &mut Dim) -> Result<(), String> {
    if dim.data_type == DataType::Double {
        return Ok(());
    }
    let from = dim.data_type;
    let cast = |buf: &[u8]| -> Result<Vec<u8>, String> {
        decode_f64(from, buf)
            .map(|values| encode_f64(&values))
            .ok_or_else(|| format!("cannot cast {:?} values to double", from))
    };

    match &mut dim.compression {
        DimCompression::None => return Ok(()),
        DimCompression::Regular { .. } => (),
        DimCompression::Domains { offs, ints, .. } => {
            *offs = cast(offs)?;
            *ints = cast(ints)?;
        }
        DimCompression::Offsets { offs } => {
            *offs = cast(offs)?;
        }
        DimCompression::Periodic { offs, ints, .. } => {
            *offs = cast(offs)?;
            *ints = cast(ints)?;
        }
    }
    dim.data_type = DataType::Double;
    Ok(())
}
