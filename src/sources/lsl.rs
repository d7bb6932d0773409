use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_double, c_float, c_int};
use std::path::PathBuf;

use libloading::Library;
use log::{info, warn};
use once_cell::sync::OnceCell;

use crate::drivers::source::negotiate_channels;
use crate::drivers::{
    Acquired, ReaderError, Result, Sample, SampleSource, StreamFormat, StreamRequest,
};

type StreamInfo = *mut c_void;
type Inlet = *mut c_void;

const MAX_STREAMS: usize = 16;
const LSL_TIMEOUT_ERROR: c_int = -1;
const LSL_LOST_ERROR: c_int = -2;

struct LslApi {
    #[allow(dead_code)]
    lib: Library,
    resolve_all: unsafe extern "C" fn(*mut StreamInfo, u32, c_double) -> c_int,
    resolve_byprop:
        unsafe extern "C" fn(*mut StreamInfo, u32, *const c_char, *const c_char, c_int, c_double) -> c_int,
    get_name: unsafe extern "C" fn(StreamInfo) -> *const c_char,
    get_channel_count: unsafe extern "C" fn(StreamInfo) -> c_int,
    get_nominal_srate: unsafe extern "C" fn(StreamInfo) -> c_double,
    get_created_at: unsafe extern "C" fn(StreamInfo) -> c_double,
    destroy_streaminfo: unsafe extern "C" fn(StreamInfo),
    create_inlet: unsafe extern "C" fn(StreamInfo, c_int, c_int, c_int) -> Inlet,
    open_stream: unsafe extern "C" fn(Inlet, c_double, *mut c_int),
    pull_sample_f: unsafe extern "C" fn(Inlet, *mut c_float, c_int, c_double, *mut c_int) -> c_double,
    close_stream: unsafe extern "C" fn(Inlet),
    destroy_inlet: unsafe extern "C" fn(Inlet),
}

impl LslApi {
    fn load(path: Option<&PathBuf>) -> std::result::Result<Self, libloading::Error> {
        let lib = match path {
            Some(path) => unsafe { Library::new(path) }?,
            None => unsafe { Library::new(libloading::library_filename("lsl")) }?,
        };
        // Safety: signatures follow the liblsl C API (lsl_c.h).
        unsafe {
            Ok(Self {
                resolve_all: *lib.get(b"lsl_resolve_all\0")?,
                resolve_byprop: *lib.get(b"lsl_resolve_byprop\0")?,
                get_name: *lib.get(b"lsl_get_name\0")?,
                get_channel_count: *lib.get(b"lsl_get_channel_count\0")?,
                get_nominal_srate: *lib.get(b"lsl_get_nominal_srate\0")?,
                get_created_at: *lib.get(b"lsl_get_created_at\0")?,
                destroy_streaminfo: *lib.get(b"lsl_destroy_streaminfo\0")?,
                create_inlet: *lib.get(b"lsl_create_inlet\0")?,
                open_stream: *lib.get(b"lsl_open_stream\0")?,
                pull_sample_f: *lib.get(b"lsl_pull_sample_f\0")?,
                close_stream: *lib.get(b"lsl_close_stream\0")?,
                destroy_inlet: *lib.get(b"lsl_destroy_inlet\0")?,
                lib,
            })
        }
    }

    /// The library is loaded once per process; later calls reuse it
    /// whatever path they ask for.
    fn instance(path: Option<&PathBuf>) -> Result<&'static LslApi> {
        static API: OnceCell<LslApi> = OnceCell::new();
        API.get_or_try_init(|| Self::load(path))
            .map_err(|e| ReaderError::unavailable("lsl", format!("stream library not loaded: {e}")))
    }

    fn resolve(&self, filter: Option<&(String, String)>, timeout_s: f64) -> Result<Vec<StreamInfo>> {
        let mut found: Vec<StreamInfo> = vec![std::ptr::null_mut(); MAX_STREAMS];
        let count = match filter {
            Some((prop, value)) => {
                let prop = CString::new(prop.as_str())
                    .map_err(|e| ReaderError::unavailable("lsl", e))?;
                let value = CString::new(value.as_str())
                    .map_err(|e| ReaderError::unavailable("lsl", e))?;
                unsafe {
                    (self.resolve_byprop)(
                        found.as_mut_ptr(),
                        MAX_STREAMS as u32,
                        prop.as_ptr(),
                        value.as_ptr(),
                        1,
                        timeout_s,
                    )
                }
            }
            None => unsafe { (self.resolve_all)(found.as_mut_ptr(), MAX_STREAMS as u32, timeout_s) },
        };
        found.truncate(count.max(0) as usize);
        Ok(found)
    }

    fn name(&self, info: StreamInfo) -> String {
        let raw = unsafe { (self.get_name)(info) };
        if raw.is_null() {
            return String::new();
        }
        unsafe { std::ffi::CStr::from_ptr(raw) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Inlet on a pub/sub stream discovered on the local network.
pub struct LslSource {
    filter: Option<(String, String)>,
    library: Option<PathBuf>,
    resolve_timeout_s: f64,
    pull_timeout_s: f64,
    api: Option<&'static LslApi>,
    inlet: Inlet,
    created_at: f64,
    values: Vec<f32>,
    n_channel: usize,
}

// The inlet is only touched by the thread that owns the source.
unsafe impl Send for LslSource {}

impl LslSource {
    pub fn new(
        filter: Option<(String, String)>,
        library: Option<PathBuf>,
        resolve_timeout_s: f64,
        timeout_ms: u64,
    ) -> Self {
        Self {
            filter,
            library,
            resolve_timeout_s,
            pull_timeout_s: timeout_ms as f64 / 1000.0,
            api: None,
            inlet: std::ptr::null_mut(),
            created_at: 0.0,
            values: Vec::new(),
            n_channel: 0,
        }
    }
}

impl SampleSource for LslSource {
    fn name(&self) -> &str {
        "lsl"
    }

    fn open(&mut self, request: &StreamRequest) -> Result<StreamFormat> {
        let api = LslApi::instance(self.library.as_ref())?;
        let streams = api.resolve(self.filter.as_ref(), self.resolve_timeout_s)?;
        let Some(&info) = streams.first() else {
            return Err(ReaderError::unavailable("lsl", "no stream found"));
        };
        let name = api.name(info);
        let channels = unsafe { (api.get_channel_count)(info) }.max(0) as usize;
        let nominal = unsafe { (api.get_nominal_srate)(info) };
        let created_at = unsafe { (api.get_created_at)(info) };
        let inlet = unsafe { (api.create_inlet)(info, 360, 0, 1) };
        for other in &streams {
            unsafe { (api.destroy_streaminfo)(*other) };
        }
        if inlet.is_null() {
            return Err(ReaderError::unavailable("lsl", format!("cannot open inlet on {name}")));
        }
        let mut ec: c_int = 0;
        unsafe { (api.open_stream)(inlet, self.resolve_timeout_s, &mut ec) };
        if ec != 0 {
            unsafe { (api.destroy_inlet)(inlet) };
            return Err(ReaderError::unavailable("lsl", format!("open_stream on {name} failed ({ec})")));
        }
        self.api = Some(api);
        self.inlet = inlet;
        self.created_at = created_at;
        self.values = vec![0.0; channels];
        self.n_channel = negotiate_channels("lsl", request, channels)?;
        let sample_rate = if nominal > 0.0 {
            nominal as f32
        } else {
            request.sample_rate
        };
        if sample_rate != request.sample_rate {
            info!("lsl stream {name} advertises {sample_rate} Hz");
        }
        Ok(StreamFormat {
            n_channel: self.n_channel,
            sample_rate,
            label: format!("lsl {name}"),
        })
    }

    fn produce(&mut self) -> Result<Acquired> {
        let Some(api) = self.api else {
            return Err(ReaderError::NotStarted);
        };
        let mut ec: c_int = 0;
        let ts = unsafe {
            (api.pull_sample_f)(
                self.inlet,
                self.values.as_mut_ptr(),
                self.values.len() as c_int,
                self.pull_timeout_s,
                &mut ec,
            )
        };
        match ec {
            0 if ts == 0.0 => Ok(Acquired::Skip),
            0 => Ok(Acquired::Sample(Sample::at(
                self.values[..self.n_channel].to_vec(),
                (ts - self.created_at) as f32,
            ))),
            LSL_TIMEOUT_ERROR => Ok(Acquired::Skip),
            LSL_LOST_ERROR => Err(ReaderError::unavailable("lsl", "stream lost")),
            other => Err(ReaderError::protocol("lsl pull", format!("error code {other}"))),
        }
    }

    fn close(&mut self) {
        if let Some(api) = self.api.take() {
            if self.inlet.is_null() {
                return;
            }
            unsafe {
                (api.close_stream)(self.inlet);
                (api.destroy_inlet)(self.inlet);
            }
            self.inlet = std::ptr::null_mut();
        }
    }
}

impl Drop for LslSource {
    fn drop(&mut self) {
        if !self.inlet.is_null() {
            warn!("lsl inlet dropped without close");
            self.close();
        }
    }
}
