//! Copy-graph executor interface.
//!
//! The relocator only ever needs one kind of device work: copying a 2-D byte
//! region of one tensor into an equally shaped region of another (or the
//! same) tensor. Copies are batched in a [`CopyGraph`] and handed to a
//! [`GraphExecutor`], which runs them in insertion order. Each copy reads its
//! whole source before writing its destination.

use std::fmt;

use kvlore_core::{Error, Result};

/// Handle to a tensor owned by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

/// A rectangular byte region of a 2-D `u8` tensor.
///
/// Executors only accept views that span a whole row (`col0 == 0` and full
/// width) or a whole column range (`row0 == 0` and full height).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorView {
    /// Tensor the view points into.
    pub tensor: TensorId,
    /// First row.
    pub row0: usize,
    /// Number of rows.
    pub rows: usize,
    /// First column (byte).
    pub col0: usize,
    /// Number of columns (bytes).
    pub cols: usize,
}

impl TensorView {
    /// Size of the region in bytes.
    #[inline]
    pub const fn bytes(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether two views describe regions of the same shape.
    #[inline]
    pub const fn same_shape(&self, other: &TensorView) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }
}

/// One queued copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOp {
    /// Region read.
    pub src: TensorView,
    /// Region written.
    pub dst: TensorView,
}

/// Pending batch of copies.
#[derive(Debug, Clone)]
pub struct CopyGraph {
    ops: Vec<CopyOp>,
    capacity: usize,
}

impl CopyGraph {
    /// Create an empty graph holding at most `capacity` copies.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Vec::new(),
            capacity,
        }
    }

    /// Queue a copy from `src` to `dst`.
    pub fn append_copy(&mut self, src: TensorView, dst: TensorView) -> Result<()> {
        if !src.same_shape(&dst) {
            return Err(Error::tensor(format!(
                "copy shape mismatch: {}x{} into {}x{}",
                src.rows, src.cols, dst.rows, dst.cols
            )));
        }
        if self.ops.len() >= self.capacity {
            return Err(Error::tensor(format!(
                "copy graph full ({} nodes)",
                self.capacity
            )));
        }
        if src.bytes() > 0 {
            self.ops.push(CopyOp { src, dst });
        }
        Ok(())
    }

    /// Queued copies in execution order.
    pub fn ops(&self) -> &[CopyOp] {
        &self.ops
    }

    /// Number of queued copies.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Node limit.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued copy.
    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

/// Device backend able to hold `u8` matrices and run copy graphs.
pub trait GraphExecutor {
    /// Allocate a zeroed `rows x cols` byte tensor.
    fn alloc_tensor(&mut self, rows: usize, cols: usize) -> Result<TensorId>;

    /// Release a tensor. Unknown ids are ignored.
    fn free_tensor(&mut self, id: TensorId);

    /// Shape of a live tensor.
    fn tensor_shape(&self, id: TensorId) -> Result<(usize, usize)>;

    /// Run every copy of `graph` in order.
    fn execute(&mut self, graph: &CopyGraph) -> Result<()>;

    /// Read a region into `out`, row-major.
    fn get_tensor(&mut self, view: &TensorView, out: &mut [u8]) -> Result<()>;

    /// Write `data` (row-major) into a region.
    fn set_tensor(&mut self, view: &TensorView, data: &[u8]) -> Result<()>;

    /// Block until all queued device work is done.
    fn synchronize(&mut self) -> Result<()>;
}
