// Snapshot: persist net parameters and solver state
//
// A training snapshot is two files written side by side:
//
//   {prefix}_iter_{N}.model        NetRecord: every layer's parameters
//   {prefix}_iter_{N}.solverstate  SolverState: iteration, multistep position,
//                                  update history, path of the .model file
//
// Either file is written as JSON or in the binary layout below. Readers
// detect the encoding from the first four bytes, so the two formats can be
// mixed freely.
//
// Binary layout (all integers and floats little-endian):
//
//   Header:
//     magic:   [u8; 4] = b"KILN"
//     version: u32     = 1
//     kind:    u8      (1 = net, 2 = solver state)
//
//   Net:
//     name: str
//     n_layers: u32
//     per layer: name: str, type: str, n_params: u32, [tensor; n_params]
//
//   Solver state:
//     iter: u64
//     current_step: u64
//     learned_net: str   (empty when absent)
//     n_history: u32, [tensor; n_history]
//
//   str:    len: u32, [u8; len] (UTF-8)
//   tensor: shape_tag: u8
//             0 => ndim: u32, [u32; ndim]
//             1 => num, channels, height, width: u32 each
//           data_len: u64, [f64; data_len]
//           diff_len: u64, [f64; diff_len]

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use kiln_core::{Error, Result, ShapeRecord, TensorRecord};

use crate::net::{LayerRecord, NetRecord};
use crate::solver::{SnapshotFormat, SolverState};

const MAGIC: &[u8; 4] = b"KILN";
const VERSION: u32 = 1;

const KIND_NET: u8 = 1;
const KIND_STATE: u8 = 2;

// Length fields come from the file; never reserve more than this up front.
const MAX_PREALLOC: usize = 1 << 16;

// Low-level IO helpers

fn write_u8(w: &mut impl Write, v: u8) -> std::io::Result<()> {
    w.write_all(&[v])
}

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_len(w: &mut impl Write, n: usize, what: &str) -> Result<()> {
    let Ok(v) = u32::try_from(n) else {
        kiln_core::bail!("cannot write snapshot: {what} {n} does not fit in 32 bits");
    };
    Ok(write_u32(w, v)?)
}

fn write_str(w: &mut impl Write, s: &str) -> Result<()> {
    write_len(w, s.len(), "string length")?;
    Ok(w.write_all(s.as_bytes())?)
}

fn write_f64s(w: &mut impl Write, values: &[f64]) -> std::io::Result<()> {
    write_u64(w, values.len() as u64)?;
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_str(r: &mut impl Read) -> Result<String> {
    let len = read_u32(r)? as usize;
    let mut buf = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        kiln_core::bail!("truncated snapshot: string of {len} bytes, {} available", buf.len());
    }
    String::from_utf8(buf).map_err(|e| Error::msg(format!("invalid UTF-8 in snapshot: {e}")))
}

fn prealloc(len: u64) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX).min(MAX_PREALLOC)
}

fn read_f64s(r: &mut impl Read) -> std::io::Result<Vec<f64>> {
    let len = read_u64(r)?;
    let mut values = Vec::with_capacity(prealloc(len));
    let mut buf = [0u8; 8];
    for _ in 0..len {
        r.read_exact(&mut buf)?;
        values.push(f64::from_le_bytes(buf));
    }
    Ok(values)
}

// Tensors

fn write_tensor(w: &mut impl Write, record: &TensorRecord) -> Result<()> {
    match &record.shape {
        ShapeRecord::Dims(dims) => {
            write_u8(w, 0)?;
            write_len(w, dims.len(), "axis count")?;
            for &d in dims {
                write_len(w, d, "dimension")?;
            }
        }
        ShapeRecord::Legacy {
            num,
            channels,
            height,
            width,
        } => {
            write_u8(w, 1)?;
            for &d in [num, channels, height, width] {
                write_len(w, d, "dimension")?;
            }
        }
    }
    write_f64s(w, &record.data)?;
    Ok(write_f64s(w, &record.diff)?)
}

fn read_tensor(r: &mut impl Read) -> Result<TensorRecord> {
    let shape = match read_u8(r)? {
        0 => {
            let ndim = read_u32(r)?;
            let mut dims = Vec::with_capacity(prealloc(ndim.into()));
            for _ in 0..ndim {
                dims.push(read_u32(r)? as usize);
            }
            ShapeRecord::Dims(dims)
        }
        1 => ShapeRecord::Legacy {
            num: read_u32(r)? as usize,
            channels: read_u32(r)? as usize,
            height: read_u32(r)? as usize,
            width: read_u32(r)? as usize,
        },
        tag => kiln_core::bail!("unknown shape tag {tag} in snapshot"),
    };
    let data = read_f64s(r)?;
    let diff = read_f64s(r)?;
    Ok(TensorRecord { shape, data, diff })
}

// Header

fn write_header(w: &mut impl Write, kind: u8) -> std::io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32(w, VERSION)?;
    write_u8(w, kind)
}

fn read_header(r: &mut impl Read, expected_kind: u8) -> Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        kiln_core::bail!("invalid snapshot: expected magic {MAGIC:?}, got {magic:?}");
    }
    let version = read_u32(r)?;
    if version != VERSION {
        kiln_core::bail!("unsupported snapshot version: {version} (expected {VERSION})");
    }
    let kind = read_u8(r)?;
    if kind != expected_kind {
        kiln_core::bail!("snapshot holds record kind {kind}, expected {expected_kind}");
    }
    Ok(())
}

// Net records

pub fn write_net_binary(w: &mut impl Write, record: &NetRecord) -> Result<()> {
    write_header(w, KIND_NET)?;
    write_str(w, &record.name)?;
    write_len(w, record.layers.len(), "layer count")?;
    for layer in &record.layers {
        write_str(w, &layer.name)?;
        write_str(w, &layer.type_name)?;
        write_len(w, layer.params.len(), "param count")?;
        for p in &layer.params {
            write_tensor(w, p)?;
        }
    }
    Ok(())
}

pub fn read_net_binary(r: &mut impl Read) -> Result<NetRecord> {
    read_header(r, KIND_NET)?;
    let name = read_str(r)?;
    let n_layers = read_u32(r)?;
    let mut layers = Vec::with_capacity(prealloc(n_layers.into()));
    for _ in 0..n_layers {
        let name = read_str(r)?;
        let type_name = read_str(r)?;
        let n_params = read_u32(r)?;
        let mut params = Vec::with_capacity(prealloc(n_params.into()));
        for _ in 0..n_params {
            params.push(read_tensor(r)?);
        }
        layers.push(LayerRecord {
            name,
            type_name,
            params,
        });
    }
    Ok(NetRecord { name, layers })
}

// Solver state records

pub fn write_state_binary(w: &mut impl Write, state: &SolverState) -> Result<()> {
    write_header(w, KIND_STATE)?;
    write_u64(w, state.iter as u64)?;
    write_u64(w, state.current_step as u64)?;
    write_str(w, state.learned_net.as_deref().unwrap_or_default())?;
    write_len(w, state.history.len(), "history count")?;
    for h in &state.history {
        write_tensor(w, h)?;
    }
    Ok(())
}

pub fn read_state_binary(r: &mut impl Read) -> Result<SolverState> {
    read_header(r, KIND_STATE)?;
    let iter = read_u64(r)? as usize;
    let current_step = read_u64(r)? as usize;
    let learned_net = Some(read_str(r)?).filter(|s| !s.is_empty());
    let n_history = read_u32(r)?;
    let mut history = Vec::with_capacity(prealloc(n_history.into()));
    for _ in 0..n_history {
        history.push(read_tensor(r)?);
    }
    Ok(SolverState {
        iter,
        current_step,
        learned_net,
        history,
    })
}

// Files

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

/// Write a net record to `path`.
pub fn save_net(path: impl AsRef<Path>, record: &NetRecord, format: SnapshotFormat) -> Result<()> {
    let mut w = create(path.as_ref())?;
    match format {
        SnapshotFormat::Binary => write_net_binary(&mut w, record)?,
        SnapshotFormat::Json => serde_json::to_writer_pretty(&mut w, record)?,
    }
    w.flush()?;
    Ok(())
}

/// Read a net record written by [`save_net`] in either format.
pub fn load_net(path: impl AsRef<Path>) -> Result<NetRecord> {
    let bytes = std::fs::read(path.as_ref())?;
    if is_binary(&bytes) {
        read_net_binary(&mut Cursor::new(bytes))
    } else {
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Write a solver state record to `path`.
pub fn save_state(path: impl AsRef<Path>, state: &SolverState, format: SnapshotFormat) -> Result<()> {
    let mut w = create(path.as_ref())?;
    match format {
        SnapshotFormat::Binary => write_state_binary(&mut w, state)?,
        SnapshotFormat::Json => serde_json::to_writer_pretty(&mut w, state)?,
    }
    w.flush()?;
    Ok(())
}

/// Read a solver state written by [`save_state`] in either format.
pub fn load_state(path: impl AsRef<Path>) -> Result<SolverState> {
    let bytes = std::fs::read(path.as_ref())?;
    if is_binary(&bytes) {
        read_state_binary(&mut Cursor::new(bytes))
    } else {
        Ok(serde_json::from_slice(&bytes)?)
    }
}
