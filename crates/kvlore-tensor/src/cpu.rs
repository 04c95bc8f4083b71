//! Candle-backed CPU executor.

use candle_core::{DType, Device, Tensor};
use kvlore_core::{Error, Result};
use tracing::trace;

use crate::executor::{CopyGraph, GraphExecutor, TensorId, TensorView};

/// Map a candle failure into a tensor error.
pub(crate) trait CandleResultExt<T> {
    fn tensor_context(self, what: &str) -> Result<T>;
}

impl<T> CandleResultExt<T> for candle_core::Result<T> {
    fn tensor_context(self, what: &str) -> Result<T> {
        self.map_err(|e| Error::tensor_with_source(what.to_string(), e))
    }
}

/// [`GraphExecutor`] storing each tensor as a `u8` candle tensor on the CPU.
pub struct CpuExecutor {
    device: Device,
    tensors: Vec<Option<Tensor>>,
}

impl CpuExecutor {
    /// Create an executor with no tensors.
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
            tensors: Vec::new(),
        }
    }

    /// Number of live tensors.
    pub fn live_tensors(&self) -> usize {
        self.tensors.iter().filter(|t| t.is_some()).count()
    }

    fn tensor(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::not_found(format!("{id}")))
    }

    fn check_bounds(&self, view: &TensorView) -> Result<(usize, usize)> {
        let (rows, cols) = self.tensor_shape(view.tensor)?;
        if view.row0 + view.rows > rows || view.col0 + view.cols > cols {
            return Err(Error::tensor(format!(
                "view [{}+{}, {}+{}] outside {} of {}x{}",
                view.row0, view.rows, view.col0, view.cols, view.tensor, rows, cols
            )));
        }
        Ok((rows, cols))
    }

    /// Copy a region out into a fresh tensor.
    fn read(&self, view: &TensorView) -> Result<Tensor> {
        self.check_bounds(view)?;
        let bytes = self
            .tensor(view.tensor)?
            .narrow(0, view.row0, view.rows)
            .and_then(|t| t.narrow(1, view.col0, view.cols))
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<u8>())
            .tensor_context("read view")?;
        Tensor::from_vec(bytes, (view.rows, view.cols), &self.device).tensor_context("stage view")
    }

    /// Write a `view.rows x view.cols` tensor into a region.
    fn write(&self, view: &TensorView, src: &Tensor) -> Result<()> {
        let (rows, cols) = self.check_bounds(view)?;
        let dst = self.tensor(view.tensor)?;
        if view.col0 == 0 && view.cols == cols {
            dst.slice_set(src, 0, view.row0).tensor_context("write rows")
        } else if view.row0 == 0 && view.rows == rows {
            dst.slice_set(src, 1, view.col0).tensor_context("write columns")
        } else {
            Err(Error::unsupported(format!(
                "view of {} spanning neither full rows nor full columns",
                view.tensor
            )))
        }
    }
}

impl Default for CpuExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphExecutor for CpuExecutor {
    fn alloc_tensor(&mut self, rows: usize, cols: usize) -> Result<TensorId> {
        let tensor = Tensor::zeros((rows, cols), DType::U8, &self.device)
            .tensor_context("allocate tensor")?;
        let id = match self.tensors.iter().position(Option::is_none) {
            Some(free) => {
                self.tensors[free] = Some(tensor);
                TensorId(free)
            }
            None => {
                self.tensors.push(Some(tensor));
                TensorId(self.tensors.len() - 1)
            }
        };
        trace!(%id, rows, cols, "tensor allocated");
        Ok(id)
    }

    fn free_tensor(&mut self, id: TensorId) {
        if let Some(slot) = self.tensors.get_mut(id.0) {
            *slot = None;
        }
    }

    fn tensor_shape(&self, id: TensorId) -> Result<(usize, usize)> {
        self.tensor(id)?.dims2().tensor_context("tensor shape")
    }

    fn execute(&mut self, graph: &CopyGraph) -> Result<()> {
        for op in graph.ops() {
            let staged = self.read(&op.src)?;
            self.write(&op.dst, &staged)?;
        }
        trace!(nodes = graph.len(), "copy graph executed");
        Ok(())
    }

    fn get_tensor(&mut self, view: &TensorView, out: &mut [u8]) -> Result<()> {
        if out.len() != view.bytes() {
            return Err(Error::tensor(format!(
                "get_tensor buffer of {} bytes for a {} byte view",
                out.len(),
                view.bytes()
            )));
        }
        if view.bytes() == 0 {
            return Ok(());
        }
        let bytes = self
            .read(view)?
            .flatten_all()
            .and_then(|t| t.to_vec1::<u8>())
            .tensor_context("get_tensor")?;
        out.copy_from_slice(&bytes);
        Ok(())
    }

    fn set_tensor(&mut self, view: &TensorView, data: &[u8]) -> Result<()> {
        if data.len() != view.bytes() {
            return Err(Error::tensor(format!(
                "set_tensor with {} bytes for a {} byte view",
                data.len(),
                view.bytes()
            )));
        }
        if view.bytes() == 0 {
            return Ok(());
        }
        let src = Tensor::from_slice(data, (view.rows, view.cols), &self.device)
            .tensor_context("set_tensor")?;
        self.write(view, &src)
    }

    fn synchronize(&mut self) -> Result<()> {
        // CPU copies complete before `execute` returns.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(id: TensorId, row0: usize, n: usize, cols: usize) -> TensorView {
        TensorView {
            tensor: id,
            row0,
            rows: n,
            col0: 0,
            cols,
        }
    }

    #[test]
    fn test_set_get_rows() {
        let mut exec = CpuExecutor::new();
        let t = exec.alloc_tensor(4, 3).unwrap();
        exec.set_tensor(&rows(t, 1, 2, 3), &[1, 2, 3, 4, 5, 6]).unwrap();

        let mut out = vec![0u8; 12];
        exec.get_tensor(&rows(t, 0, 4, 3), &mut out).unwrap();
        assert_eq!(out, vec![0, 0, 0, 1, 2, 3, 4, 5, 6, 0, 0, 0]);
    }

    #[test]
    fn test_set_get_columns() {
        let mut exec = CpuExecutor::new();
        let t = exec.alloc_tensor(2, 4).unwrap();
        let cols = TensorView {
            tensor: t,
            row0: 0,
            rows: 2,
            col0: 1,
            cols: 2,
        };
        exec.set_tensor(&cols, &[7, 8, 9, 10]).unwrap();

        let mut out = vec![0u8; 8];
        exec.get_tensor(&rows(t, 0, 2, 4), &mut out).unwrap();
        assert_eq!(out, vec![0, 7, 8, 0, 0, 9, 10, 0]);
    }

    #[test]
    fn test_overlapping_copy_behaves_like_memmove() {
        let mut exec = CpuExecutor::new();
        let t = exec.alloc_tensor(6, 1).unwrap();
        exec.set_tensor(&rows(t, 0, 6, 1), &[1, 2, 3, 4, 5, 6]).unwrap();

        let mut graph = CopyGraph::new(8);
        graph.append_copy(rows(t, 0, 4, 1), rows(t, 2, 4, 1)).unwrap();
        exec.execute(&graph).unwrap();

        let mut out = vec![0u8; 6];
        exec.get_tensor(&rows(t, 0, 6, 1), &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 1, 2, 3, 4]);
    }

    #[test]
    fn test_partial_view_rejected() {
        let mut exec = CpuExecutor::new();
        let t = exec.alloc_tensor(4, 4).unwrap();
        let inner = TensorView {
            tensor: t,
            row0: 1,
            rows: 2,
            col0: 1,
            cols: 2,
        };
        assert!(exec.set_tensor(&inner, &[0; 4]).is_err());
        assert!(exec.set_tensor(&rows(t, 3, 2, 4), &[0; 8]).is_err());
    }

    #[test]
    fn test_free_and_reuse_slot() {
        let mut exec = CpuExecutor::new();
        let a = exec.alloc_tensor(2, 2).unwrap();
        let _b = exec.alloc_tensor(2, 2).unwrap();
        exec.free_tensor(a);
        assert_eq!(exec.live_tensors(), 1);
        assert!(exec.tensor_shape(a).is_err());
        let c = exec.alloc_tensor(3, 3).unwrap();
        assert_eq!(c, a);
        assert_eq!(exec.tensor_shape(c).unwrap(), (3, 3));
    }
}
