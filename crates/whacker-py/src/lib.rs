use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};
use pyo3::{Bound, Py};

use ::whacker as wh;
use wh::config::{DEFAULT_DEPTH, DEFAULT_QUEUE_DEPTH, FILLER_TIMEOUT};
use wh::{Config, FrameDecoder, PipelineSettingsBuilder, Simulator, SymbolKind};

#[pyclass(unsendable)]
struct Pipeline {
    inner: Simulator,
}

#[pymethods]
impl Pipeline {
    #[new]
    #[pyo3(signature = (depth=DEFAULT_DEPTH, queue_depth=DEFAULT_QUEUE_DEPTH, filler_timeout=FILLER_TIMEOUT))]
    fn new(depth: usize, queue_depth: usize, filler_timeout: u64) -> PyResult<Self> {
        let settings = PipelineSettingsBuilder::new()
            .depth(depth)
            .queue_depth(queue_depth)
            .filler_timeout(filler_timeout)
            .build()
            .map_err(|err| PyValueError::new_err(err.to_string()))?;
        Ok(Self {
            inner: Simulator::new(&settings),
        })
    }

    #[pyo3(signature = (enable=false, debug_discard=false, filter_nak=false, filter_sof=false))]
    fn set_config(&mut self, enable: bool, debug_discard: bool, filter_nak: bool, filter_sof: bool) {
        let config = Config::default()
            .with_enable(enable)
            .with_debug_discard(debug_discard)
            .with_filter_nak(filter_nak)
            .with_filter_sof(filter_sof);
        self.inner.set_config(config);
    }

    #[getter]
    fn config(&self) -> u8 {
        self.inner.config().bits()
    }

    #[getter]
    fn now(&self) -> u64 {
        self.inner.now()
    }

    /// Queue one receiver symbol: "data", "sop", "eop", "error" or "overflow".
    #[pyo3(signature = (kind, byte=None))]
    fn send(&mut self, kind: &str, byte: Option<u8>) -> PyResult<()> {
        let kind = parse_symbol(kind, byte)?;
        self.inner.send(kind);
        Ok(())
    }

    fn packet(&mut self, data: &[u8]) {
        self.inner.packet(data);
    }

    fn idle(&mut self, ticks: u64) {
        self.inner.idle(ticks);
    }

    fn drain(&mut self) -> PyResult<()> {
        self.inner
            .drain()
            .map_err(|err| PyRuntimeError::new_err(err.to_string()))
    }

    fn take_output<'py>(&mut self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, &self.inner.take_output())
    }

    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.inner.stats();
        let dict = PyDict::new(py);
        dict.set_item("packets", stats.packets)?;
        dict.set_item("sessions", stats.sessions)?;
        dict.set_item("truncated", stats.truncated)?;
        dict.set_item("errors", stats.errors)?;
        dict.set_item("overflows", stats.overflows)?;
        dict.set_item("discarded", stats.discarded)?;
        dict.set_item("frames", stats.frames)?;
        dict.set_item("skipped", stats.skipped)?;
        dict.set_item("fillers", stats.fillers)?;
        dict.set_item("bytes", stats.bytes)?;
        Ok(dict)
    }
}

#[pyclass(unsendable)]
struct Decoder {
    inner: FrameDecoder,
}

#[pymethods]
impl Decoder {
    #[new]
    #[pyo3(signature = (origin=0))]
    fn new(origin: u64) -> Self {
        Self {
            inner: FrameDecoder::with_origin(origin),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.inner.push(data);
    }

    #[getter]
    fn fillers(&self) -> u64 {
        self.inner.fillers()
    }

    fn __iter__(slf: PyRef<Self>) -> PyRef<Self> {
        slf
    }

    fn __next__(mut slf: PyRefMut<Self>, py: Python<'_>) -> PyResult<Option<Py<Frame>>> {
        match slf.inner.next_frame() {
            Some(Ok(frame)) => {
                let frame = Frame {
                    discarded: frame.discarded,
                    flags: frame.flags.bits(),
                    truncated: frame.is_truncated(),
                    timestamp: frame.timestamp,
                    delta: frame.delta,
                    payload: frame.payload,
                };
                Py::new(py, frame).map(Some)
            }
            Some(Err(err)) => Err(PyValueError::new_err(err.to_string())),
            None => Ok(None),
        }
    }
}

#[pyclass]
struct Frame {
    #[pyo3(get)]
    discarded: bool,
    #[pyo3(get)]
    flags: u8,
    #[pyo3(get)]
    truncated: bool,
    #[pyo3(get)]
    timestamp: u64,
    #[pyo3(get)]
    delta: u64,
    payload: Vec<u8>,
}

#[pymethods]
impl Frame {
    #[getter]
    fn payload<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, &self.payload)
    }
}

#[pymodule]
fn whacker(_py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Pipeline>()?;
    m.add_class::<Decoder>()?;
    m.add_class::<Frame>()?;
    Ok(())
}

fn parse_symbol(kind: &str, byte: Option<u8>) -> PyResult<SymbolKind> {
    let normalized = kind.to_ascii_lowercase();
    match (normalized.as_str(), byte) {
        ("data", Some(byte)) => Ok(SymbolKind::Data(byte)),
        ("data", None) => Err(PyValueError::new_err("data symbols need a byte value")),
        ("sop" | "start", _) => Ok(SymbolKind::StartOfPacket),
        ("eop" | "end", _) => Ok(SymbolKind::EndOfPacket),
        ("error" | "err", _) => Ok(SymbolKind::LineError),
        ("overflow" | "ovf", _) => Ok(SymbolKind::RxOverflow),
        _ => Err(PyValueError::new_err(
            "symbol must be one of: data, sop, eop, error, overflow",
        )),
    }
}
