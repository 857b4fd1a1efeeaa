//! Cache-friendly matrix transposition and a traced evaluation that replays
//! a transposer's memory references through the simulator.

use anyhow::{Result, ensure};
use log::debug;

use crate::{
    cache::{CacheStats, Geometry},
    simulator::Simulator,
    trace::{AccessKind, TraceRecord},
};

/// Largest dimension the traced memory layout has room for.
pub const MAX_DIM: usize = 256;
const ELEMENT_SIZE: u64 = size_of::<i32>() as u64;
/// Base address of the source matrix in the traced layout.
pub const SOURCE_BASE: u64 = 0x0010_0000;
/// The destination region starts right after a full `MAX_DIM` square source,
/// so both map onto the same cache sets.
pub const DEST_BASE: u64 = SOURCE_BASE + (MAX_DIM * MAX_DIM) as u64 * ELEMENT_SIZE;

/// Row-major `rows x cols` matrix of `i32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<i32>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> i32) -> Self {
        let data = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .map(|(r, c)| f(r, c))
            .collect();
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.data[self.offset(row, col)]
    }

    pub fn set(&mut self, row: usize, col: usize, value: i32) {
        let idx = self.offset(row, col);
        self.data[idx] = value;
    }

    fn offset(&self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.rows && col < self.cols);
        row * self.cols + col
    }
}

/// `true` iff `dest` is `source` transposed.
pub fn is_transpose(source: &Matrix, dest: &Matrix) -> bool {
    if source.rows != dest.cols || source.cols != dest.rows {
        return false;
    }
    (0..source.rows).all(|i| (0..source.cols).all(|j| source.get(i, j) == dest.get(j, i)))
}

/// Source and destination of one transposition, optionally recording every
/// element load and store as a trace record.
pub struct TransposeBuffers<'a> {
    source: &'a Matrix,
    dest: &'a mut Matrix,
    log: Option<&'a mut Vec<TraceRecord>>,
}

impl<'a> TransposeBuffers<'a> {
    pub fn new(source: &'a Matrix, dest: &'a mut Matrix) -> Self {
        debug_assert_eq!((source.rows, source.cols), (dest.cols, dest.rows));
        Self {
            source,
            dest,
            log: None,
        }
    }

    pub fn traced(source: &'a Matrix, dest: &'a mut Matrix, log: &'a mut Vec<TraceRecord>) -> Self {
        Self {
            log: Some(log),
            ..Self::new(source, dest)
        }
    }

    /// Rows of the source (`N`).
    pub fn rows(&self) -> usize {
        self.source.rows
    }

    /// Columns of the source (`M`).
    pub fn cols(&self) -> usize {
        self.source.cols
    }

    pub fn load(&mut self, row: usize, col: usize) -> i32 {
        let address = element_address(SOURCE_BASE, self.source.cols, row, col);
        self.record(AccessKind::Load, address);
        self.source.get(row, col)
    }

    pub fn store(&mut self, row: usize, col: usize, value: i32) {
        let address = element_address(DEST_BASE, self.dest.cols, row, col);
        self.record(AccessKind::Store, address);
        self.dest.set(row, col, value);
    }

    fn record(&mut self, kind: AccessKind, address: u64) {
        if let Some(log) = self.log.as_mut() {
            log.push(TraceRecord::new(kind, address, ELEMENT_SIZE as u32));
        }
    }
}

fn element_address(base: u64, cols: usize, row: usize, col: usize) -> u64 {
    base + (row * cols + col) as u64 * ELEMENT_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// 32 x 32
    Small,
    /// 64 x 64
    Medium,
    /// Anything else, e.g. 61 x 67.
    Irregular,
}

pub struct TilePolicy {
    pub class: SizeClass,
    pub tile: usize,
    applies: fn(usize, usize) -> bool,
}

fn is_small(rows: usize, cols: usize) -> bool {
    rows == 32 && cols == 32
}

fn is_medium(rows: usize, cols: usize) -> bool {
    rows == 64 && cols == 64
}

fn any_size(_: usize, _: usize) -> bool {
    true
}

static TILE_POLICIES: [TilePolicy; 3] = [
    TilePolicy {
        class: SizeClass::Small,
        tile: 8,
        applies: is_small,
    },
    TilePolicy {
        class: SizeClass::Medium,
        tile: 4,
        applies: is_medium,
    },
    TilePolicy {
        class: SizeClass::Irregular,
        tile: 16,
        applies: any_size,
    },
];

pub fn tile_policy(rows: usize, cols: usize) -> &'static TilePolicy {
    TILE_POLICIES
        .iter()
        .find(|policy| (policy.applies)(rows, cols))
        .unwrap_or(&TILE_POLICIES[2])
}

/// Tiled transpose. Within a tile row the diagonal element is held back and
/// stored last, after the rest of the row has been written.
pub fn blocked_transpose(buf: &mut TransposeBuffers<'_>) {
    let (rows, cols) = (buf.rows(), buf.cols());
    let tile = tile_policy(rows, cols).tile;
    for col_start in (0..cols).step_by(tile) {
        let col_end = (col_start + tile).min(cols);
        for row_start in (0..rows).step_by(tile) {
            let row_end = (row_start + tile).min(rows);
            for row in row_start..row_end {
                let mut diagonal = None;
                for col in col_start..col_end {
                    let value = buf.load(row, col);
                    if row == col {
                        diagonal = Some(value);
                    } else {
                        buf.store(col, row, value);
                    }
                }
                if let Some(value) = diagonal {
                    buf.store(row, row, value);
                }
            }
        }
    }
}

/// Row-wise scan with no blocking.
pub fn row_scan_transpose(buf: &mut TransposeBuffers<'_>) {
    for row in 0..buf.rows() {
        for col in 0..buf.cols() {
            let value = buf.load(row, col);
            buf.store(col, row, value);
        }
    }
}

pub type TransposeFn = fn(&mut TransposeBuffers<'_>);

pub struct Transposer {
    pub description: &'static str,
    pub run: TransposeFn,
}

pub static TRANSPOSERS: [Transposer; 2] = [
    Transposer {
        description: "Transpose submission",
        run: blocked_transpose,
    },
    Transposer {
        description: "Simple row-wise scan transpose",
        run: row_scan_transpose,
    },
];

/// Transposes `source` into a fresh matrix.
pub fn transpose(source: &Matrix) -> Matrix {
    let mut dest = Matrix::new(source.cols, source.rows);
    blocked_transpose(&mut TransposeBuffers::new(source, &mut dest));
    dest
}

#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    pub stats: CacheStats,
    pub correct: bool,
    pub references: usize,
}

/// Geometry the transposers are judged against: 1 KiB direct-mapped with
/// 32-byte blocks.
pub fn evaluation_geometry() -> Geometry {
    match Geometry::new(5, 1, 5) {
        Ok(geometry) => geometry,
        Err(err) => unreachable!("fixed evaluation geometry is valid: {err}"),
    }
}

/// Runs `transposer` on a `rows x cols` source and replays its references
/// through the evaluation cache.
pub fn evaluate(transposer: &Transposer, rows: usize, cols: usize) -> Result<Evaluation> {
    ensure!(rows > 0 && cols > 0, "matrix dimensions must be non-zero");
    ensure!(
        rows <= MAX_DIM && cols <= MAX_DIM,
        "matrix {rows}x{cols} exceeds the {MAX_DIM}x{MAX_DIM} traced layout"
    );
    let source = Matrix::from_fn(rows, cols, |r, c| (r * cols + c) as i32);
    let mut dest = Matrix::new(cols, rows);
    let mut log = Vec::new();
    (transposer.run)(&mut TransposeBuffers::traced(&source, &mut dest, &mut log));

    let mut sim = Simulator::new(evaluation_geometry());
    let stats = sim.run_trace(&log);
    debug!(
        "{} on {rows}x{cols}: {} references, {stats}",
        transposer.description,
        log.len()
    );
    Ok(Evaluation {
        stats,
        correct: is_transpose(&source, &dest),
        references: log.len(),
    })
}
