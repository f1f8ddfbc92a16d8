//! CCD frame acquisition
//!
//! [`CcdFrameExecution`] configures a camera (upload mode, frame type,
//! binning, filter slot), then runs `exposure_count` exposures. For every
//! exposure it polls CCD_EXPOSURE until the camera leaves Busy, waits for the
//! image BLOB when the server sends images, and annotates the FITS header
//! with what the selected telescope knows about the pointing before saving
//! the frame into the client directory.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use skybridge_alignment::{
    range_shift_hour_angle, range_shift_right_ascension, AlignmentModel, PierSide,
};
use skybridge_imaging::metadata::{self, J2000};
use skybridge_imaging::{image_properties, FitsImage, ImageMetadata};
use skybridge_indi::{
    standard_properties as props, AbortToken, IndiClient, NewPropertyItem, PropertyState,
    PropertyType, SendMode,
};

use crate::file_template::{expand_template, TemplateContext};
use crate::guard::RunningGuard;
use crate::plate_solver::{PlateSolver, PlateSolverParameters};
use crate::{ExecutionError, ExecutionEvent, ExecutionObserver, ExecutionResult};

pub const DEFAULT_SERVER_FILE_NAME_TEMPLATE: &str = "%f_B%b_E%e_%n";
pub const DEFAULT_CLIENT_FILE_NAME_TEMPLATE: &str = "%f_B%b_E%e_%F_%n";

/// Where the server puts acquired images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UploadMode {
    /// Sent to the client only
    #[default]
    Client,
    /// Kept on the server only
    Server,
    Both,
}

impl UploadMode {
    pub fn element(self) -> &'static str {
        match self {
            UploadMode::Client => props::UPLOAD_CLIENT,
            UploadMode::Server => props::UPLOAD_LOCAL,
            UploadMode::Both => props::UPLOAD_BOTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FrameType {
    #[default]
    Light,
    Bias,
    Dark,
    Flat,
}

impl FrameType {
    /// File name prefix
    pub fn prefix(self) -> &'static str {
        match self {
            FrameType::Light => "LIGHT",
            FrameType::Bias => "BIAS",
            FrameType::Dark => "DARK",
            FrameType::Flat => "FLAT",
        }
    }

    pub fn element(self) -> &'static str {
        match self {
            FrameType::Light => props::FRAME_LIGHT,
            FrameType::Bias => props::FRAME_BIAS,
            FrameType::Dark => props::FRAME_DARK,
            FrameType::Flat => props::FRAME_FLAT,
        }
    }
}

/// How the mount that annotates light frames is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TelescopeSelection {
    None,
    /// ACTIVE_DEVICES.ACTIVE_TELESCOPE of the camera
    Active,
    /// The mount selected by the host
    MountController,
    #[default]
    MountControllerOrActive,
    DeviceName,
}

/// Converts apparent (true equator and equinox of date) coordinates to
/// GCRS. Degrees in and out.
pub trait EphemerisService: Send + Sync {
    fn apparent_to_gcrs(&self, ra: f64, dec: f64, time: DateTime<Utc>) -> (f64, f64);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcdFrameParameters {
    pub device_name: String,
    pub upload_mode: UploadMode,
    pub server_upload_directory: String,
    pub server_file_name_template: String,
    pub frame_type: FrameType,
    pub binning_x: u32,
    pub binning_y: u32,
    /// 1-based, 0 leaves the wheel alone
    pub filter_slot: u32,
    /// Filter wheel device when the camera has no built-in wheel
    pub external_filter_wheel: String,
    /// Seconds
    pub exposure_time: f64,
    /// Seconds between exposures
    pub exposure_delay: f64,
    pub exposure_count: u32,
    pub object_name: String,
    pub telescope_selection: TelescopeSelection,
    /// Fail instead of skipping the annotation when no telescope is found
    pub require_selected_telescope: bool,
    pub telescope_device_name: String,
    /// Mount currently selected by the host, for the MountController modes
    pub mount_controller_device: String,
    /// Remove the pointing model from the reported telescope position
    pub enable_alignment_correction: bool,
    pub alignment_file: PathBuf,
    /// Millimeters, used when the mount does not report one
    pub telescope_focal_length: f64,
    /// Empty means the system temp directory
    pub client_download_directory: PathBuf,
    pub client_file_name_template: String,
    pub save_client_images: bool,
    pub overwrite_client_images: bool,
    pub apply_plate_solver: bool,
    pub plate_solver: PlateSolverParameters,
}

impl Default for CcdFrameParameters {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            upload_mode: UploadMode::Client,
            server_upload_directory: String::new(),
            server_file_name_template: DEFAULT_SERVER_FILE_NAME_TEMPLATE.to_string(),
            frame_type: FrameType::Light,
            binning_x: 1,
            binning_y: 1,
            filter_slot: 0,
            external_filter_wheel: String::new(),
            exposure_time: 1.0,
            exposure_delay: 0.0,
            exposure_count: 1,
            object_name: String::new(),
            telescope_selection: TelescopeSelection::MountControllerOrActive,
            require_selected_telescope: false,
            telescope_device_name: String::new(),
            mount_controller_device: String::new(),
            enable_alignment_correction: false,
            alignment_file: PathBuf::new(),
            telescope_focal_length: 0.0,
            client_download_directory: PathBuf::new(),
            client_file_name_template: DEFAULT_CLIENT_FILE_NAME_TEMPLATE.to_string(),
            save_client_images: true,
            overwrite_client_images: false,
            apply_plate_solver: false,
            plate_solver: PlateSolverParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CcdFrameOutputs {
    pub client_file_paths: Vec<PathBuf>,
    /// File names the server stores frames under
    pub server_frames: Vec<String>,
    pub success_count: u32,
    pub error_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct ImageRouting {
    server_sends_image: bool,
    server_keeps_image: bool,
}

/// Telescope annotating the frames and where it pointed during the exposure
#[derive(Debug, Clone)]
struct TelescopePointing {
    device: String,
    /// Hours
    ra: f64,
    /// Degrees
    dec: f64,
}

pub struct CcdFrameExecution {
    client: Arc<IndiClient>,
    parameters: Mutex<CcdFrameParameters>,
    outputs: Mutex<CcdFrameOutputs>,
    observer: Arc<dyn ExecutionObserver>,
    ephemeris: Option<Arc<dyn EphemerisService>>,
    plate_solver: Option<Arc<dyn PlateSolver>>,
    abort: AbortToken,
    running: AtomicBool,
    aborted: AtomicBool,
}

impl CcdFrameExecution {
    pub fn new(
        client: Arc<IndiClient>,
        parameters: CcdFrameParameters,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Self {
        let abort = client.abort_token();
        Self {
            client,
            parameters: Mutex::new(parameters),
            outputs: Mutex::new(CcdFrameOutputs::default()),
            observer,
            ephemeris: None,
            plate_solver: None,
            abort,
            running: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn with_ephemeris(mut self, ephemeris: Arc<dyn EphemerisService>) -> Self {
        self.ephemeris = Some(ephemeris);
        self
    }

    pub fn with_plate_solver(mut self, plate_solver: Arc<dyn PlateSolver>) -> Self {
        self.plate_solver = Some(plate_solver);
        self
    }

    pub fn parameters(&self) -> CcdFrameParameters {
        self.parameters.lock().clone()
    }

    pub fn set_parameters(&self, parameters: CcdFrameParameters) {
        *self.parameters.lock() = parameters;
    }

    pub fn outputs(&self) -> CcdFrameOutputs {
        self.outputs.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Cancel the series. Like [`MountExecution::abort`](crate::MountExecution::abort)
    /// this trips the client's token, which every execution on that client
    /// observes until its next `perform`.
    pub fn abort(&self) {
        if self.is_running() {
            self.abort.abort();
        }
    }

    pub async fn perform(&self) -> ExecutionResult<CcdFrameOutputs> {
        let _running = RunningGuard::acquire(&self.running)?;
        *self.outputs.lock() = CcdFrameOutputs::default();

        let parameters = self.parameters();
        if parameters.device_name.is_empty() {
            return Err(ExecutionError::NoDevice);
        }
        if !self.client.has_devices() {
            return Err(ExecutionError::NoDevicesConnected);
        }

        self.abort.reset();
        self.aborted.store(false, Ordering::SeqCst);

        match self.run(&parameters).await {
            Ok(()) => Ok(self.outputs()),
            Err(e) if e.is_aborted() => {
                self.aborted.store(true, Ordering::SeqCst);
                let request = NewPropertyItem::switch_on(
                    &parameters.device_name,
                    props::CCD_ABORT_EXPOSURE,
                    props::ABORT,
                );
                if let Err(e) = self
                    .client
                    .maybe_send_new_property_item(&request, SendMode::Async)
                    .await
                {
                    tracing::warn!("Abort exposure request failed: {}", e);
                }
                self.observer.on_event(&ExecutionEvent::Aborted);
                Err(ExecutionError::Aborted)
            }
            Err(e) => {
                tracing::error!("Acquisition on {} failed: {}", parameters.device_name, e);
                Err(e)
            }
        }
    }

    async fn run(&self, p: &CcdFrameParameters) -> ExecutionResult<()> {
        self.validate_device(&p.device_name)?;
        let telescope = self.telescope_device_name(p)?;
        self.send_device_properties(p).await?;
        let routing = self.image_routing(&p.device_name);

        self.observer.on_event(&ExecutionEvent::AcquisitionStarted);
        let result = self.acquire(p, telescope.as_deref(), routing).await;
        self.observer.on_event(&ExecutionEvent::AcquisitionEnded);
        result
    }

    // =========================================================================
    // SETUP
    // =========================================================================

    fn validate_device(&self, device: &str) -> ExecutionResult<()> {
        if !self.client.has_device(device) {
            return Err(ExecutionError::DeviceUnavailable(device.to_string()));
        }
        if !self
            .client
            .has_element(device, props::CCD_FRAME, props::CCD_FRAME_WIDTH)
        {
            return Err(ExecutionError::NotACamera(device.to_string()));
        }
        Ok(())
    }

    /// Mount used to annotate light frames. Selection problems are errors
    /// only when `require_selected_telescope` is set.
    pub fn telescope_device_name(&self, p: &CcdFrameParameters) -> ExecutionResult<Option<String>> {
        if p.frame_type != FrameType::Light {
            return Ok(None);
        }
        let fail = |message: &str| {
            if p.require_selected_telescope {
                Err(ExecutionError::TelescopeSelection(message.to_string()))
            } else {
                Ok(None)
            }
        };
        let active = || {
            self.client
                .get_text(&p.device_name, props::ACTIVE_DEVICES, props::ACTIVE_TELESCOPE)
                .map(|name| name.trim().to_string())
        };

        let name = match p.telescope_selection {
            TelescopeSelection::None => return Ok(None),
            TelescopeSelection::Active => match active() {
                Some(name) if !name.is_empty() => name,
                Some(_) => return fail("no active telescope has been defined"),
                None => return fail("the active telescope property is not available"),
            },
            TelescopeSelection::MountController => {
                let name = p.mount_controller_device.trim();
                if name.is_empty() {
                    return fail("no mount controller device is selected");
                }
                name.to_string()
            }
            TelescopeSelection::MountControllerOrActive => {
                let name = p.mount_controller_device.trim();
                if !name.is_empty() {
                    name.to_string()
                } else {
                    match active() {
                        Some(name) if !name.is_empty() => name,
                        _ => return fail("no telescope device is available or selected"),
                    }
                }
            }
            TelescopeSelection::DeviceName => {
                let name = p.telescope_device_name.trim();
                if name.is_empty() {
                    return fail("no telescope device name has been specified");
                }
                name.to_string()
            }
        };

        if !self.client.has_device(&name) {
            return if p.require_selected_telescope {
                Err(ExecutionError::DeviceUnavailable(name))
            } else {
                Ok(None)
            };
        }
        if !self
            .client
            .has_element(&name, props::EQUATORIAL_EOD_COORD, props::RA)
        {
            return if p.require_selected_telescope {
                Err(ExecutionError::NotAMount(name))
            } else {
                Ok(None)
            };
        }
        Ok(Some(name))
    }

    fn filter_device<'a>(&self, p: &'a CcdFrameParameters) -> &'a str {
        if p.external_filter_wheel.trim().is_empty() {
            &p.device_name
        } else {
            p.external_filter_wheel.trim()
        }
    }

    async fn send_device_properties(&self, p: &CcdFrameParameters) -> ExecutionResult<()> {
        let device = p.device_name.as_str();
        let mut requests = vec![NewPropertyItem::switch_on(
            device,
            props::UPLOAD_MODE,
            p.upload_mode.element(),
        )];
        if !p.server_upload_directory.is_empty() {
            requests.push(
                NewPropertyItem::new(device, props::UPLOAD_SETTINGS, PropertyType::Text)
                    .with_element(props::UPLOAD_DIR, &p.server_upload_directory),
            );
        }
        requests.push(NewPropertyItem::switch_on(
            device,
            props::CCD_FRAME_TYPE,
            p.frame_type.element(),
        ));
        if p.binning_x > 0 && p.binning_y > 0 {
            requests.push(NewPropertyItem::numbers(
                device,
                props::CCD_BINNING,
                &[
                    (props::HOR_BIN, f64::from(p.binning_x)),
                    (props::VER_BIN, f64::from(p.binning_y)),
                ],
            ));
        }
        if p.filter_slot > 0 {
            requests.push(NewPropertyItem::numbers(
                self.filter_device(p),
                props::FILTER_SLOT,
                &[(props::FILTER_SLOT_VALUE, f64::from(p.filter_slot))],
            ));
        }

        for request in &requests {
            self.client
                .maybe_send_new_property_item(request, SendMode::Sync)
                .await?;
        }
        Ok(())
    }

    /// Drivers without UPLOAD_MODE always send images
    fn image_routing(&self, device: &str) -> ImageRouting {
        let switch_on = |element: &str| {
            self.client
                .get_property(device, props::UPLOAD_MODE, element, false)
                .map(|item| item.is_on())
        };
        match switch_on(props::UPLOAD_LOCAL) {
            Some(true) => ImageRouting {
                server_sends_image: false,
                server_keeps_image: true,
            },
            Some(false) => ImageRouting {
                server_sends_image: true,
                server_keeps_image: switch_on(props::UPLOAD_BOTH).unwrap_or(false),
            },
            None => ImageRouting {
                server_sends_image: true,
                server_keeps_image: false,
            },
        }
    }

    // =========================================================================
    // FILE NAMES
    // =========================================================================

    fn current_filter_name(&self, p: &CcdFrameParameters) -> Option<String> {
        let device = self.filter_device(p);
        let slot = self
            .client
            .get_number(device, props::FILTER_SLOT, props::FILTER_SLOT_VALUE)?;
        let element = format!("{}{}", props::FILTER_SLOT_NAME_PREFIX, slot.round() as i64);
        self.client
            .get_text(device, props::FILTER_NAME, &element)
            .map(|name| name.trim().to_string())
    }

    fn template_context(&self, p: &CcdFrameParameters, exposure_number: u32) -> TemplateContext {
        TemplateContext::new(p.frame_type.prefix())
            .with_binning(p.binning_x, p.binning_y)
            .with_exposure(p.exposure_time)
            .with_filter(self.current_filter_name(p))
            .with_temperature(self.client.get_number(
                &p.device_name,
                props::CCD_TEMPERATURE,
                props::CCD_TEMPERATURE_VALUE,
            ))
            .with_exposure_number(exposure_number)
    }

    fn file_name(&self, template: &str, fallback: &str, context: &TemplateContext) -> String {
        let name = expand_template(template, context);
        if name.is_empty() {
            expand_template(fallback, context)
        } else {
            name
        }
    }

    pub fn server_file_name(&self, p: &CcdFrameParameters, exposure_number: u32) -> String {
        let context = self.template_context(p, exposure_number);
        self.file_name(
            &p.server_file_name_template,
            DEFAULT_SERVER_FILE_NAME_TEMPLATE,
            &context,
        )
    }

    pub fn client_file_name(&self, p: &CcdFrameParameters, exposure_number: u32) -> String {
        let context = self.template_context(p, exposure_number);
        self.file_name(
            &p.client_file_name_template,
            DEFAULT_CLIENT_FILE_NAME_TEMPLATE,
            &context,
        )
    }

    // =========================================================================
    // ACQUISITION
    // =========================================================================

    async fn acquire(
        &self,
        p: &CcdFrameParameters,
        telescope: Option<&str>,
        routing: ImageRouting,
    ) -> ExecutionResult<()> {
        let device = p.device_name.as_str();
        let count = p.exposure_count;

        for number in 0..count {
            self.observer
                .on_event(&ExecutionEvent::NewExposure { number, count });

            if number > 0 && p.exposure_delay > 0.0 {
                self.exposure_delay(p.exposure_delay).await?;
            }

            self.client.clear_downloaded_image_path();

            if routing.server_keeps_image {
                let name = self.server_file_name(p, number);
                self.outputs.lock().server_frames.push(name.clone());
                self.client
                    .send_new_property_value(
                        device,
                        props::UPLOAD_SETTINGS,
                        PropertyType::Text,
                        props::UPLOAD_PREFIX,
                        name,
                        SendMode::Sync,
                    )
                    .await?;
            }

            if let Err(e) = self
                .client
                .send_new_property_value(
                    device,
                    props::CCD_EXPOSURE,
                    PropertyType::Number,
                    props::CCD_EXPOSURE_VALUE,
                    p.exposure_time,
                    SendMode::Async,
                )
                .await
            {
                if e.is_aborted() {
                    return Err(e.into());
                }
                self.observer.on_event(&ExecutionEvent::ExposureError {
                    message: format!("Failure to send new property values to INDI server: {}", e),
                });
                self.outputs.lock().error_count += 1;
                continue;
            }

            let pointing = match telescope {
                Some(telescope) => Some(self.telescope_pointing(telescope)?),
                None => None,
            };

            if !self.wait_for_exposure(p, number).await? {
                continue;
            }

            if routing.server_sends_image {
                let path = self.wait_for_download().await?;
                self.process_frame(p, number, &path, pointing.as_ref()).await?;
            }
            self.client.clear_downloaded_image_path();
        }
        Ok(())
    }

    async fn exposure_delay(&self, total_secs: f64) -> ExecutionResult<()> {
        self.observer
            .on_event(&ExecutionEvent::ExposureDelayStarted { total_secs });
        let poll_interval = self.client.config().poll_interval();
        let start = Instant::now();
        loop {
            if self.abort.is_aborted() {
                return Err(ExecutionError::Aborted);
            }
            let elapsed_secs = start.elapsed().as_secs_f64();
            if elapsed_secs >= total_secs {
                break;
            }
            self.observer
                .on_event(&ExecutionEvent::ExposureDelay { elapsed_secs });
            let remaining = Duration::from_secs_f64(total_secs - elapsed_secs);
            sleep(poll_interval.min(remaining)).await;
        }
        self.observer.on_event(&ExecutionEvent::ExposureDelayEnded);
        Ok(())
    }

    /// Epoch-of-date coordinates at the start of the exposure
    fn telescope_pointing(&self, telescope: &str) -> ExecutionResult<TelescopePointing> {
        let eod = props::EQUATORIAL_EOD_COORD;
        let ra = self
            .client
            .get_number(telescope, eod, props::RA)
            .ok_or_else(|| ExecutionError::missing(telescope, eod, props::RA))?;
        let dec = self
            .client
            .get_number(telescope, eod, props::DEC)
            .ok_or_else(|| ExecutionError::missing(telescope, eod, props::DEC))?;
        Ok(TelescopePointing {
            device: telescope.to_string(),
            ra,
            dec,
        })
    }

    /// Poll CCD_EXPOSURE until the exposure is over. Returns false when the
    /// camera reported a failed exposure.
    async fn wait_for_exposure(&self, p: &CcdFrameParameters, number: u32) -> ExecutionResult<bool> {
        let device = p.device_name.as_str();
        let count = p.exposure_count;
        let poll_interval = self.client.config().poll_interval();
        let start = Instant::now();
        let mut in_exposure = false;

        loop {
            if self.abort.is_aborted() {
                return Err(ExecutionError::Aborted);
            }
            let item = self
                .client
                .get_property(device, props::CCD_EXPOSURE, props::CCD_EXPOSURE_VALUE, false)
                .ok_or_else(|| {
                    ExecutionError::missing(device, props::CCD_EXPOSURE, props::CCD_EXPOSURE_VALUE)
                })?;

            match item.state {
                PropertyState::Busy if in_exposure => {
                    // The driver counts the remaining time down
                    let remaining = item.number().unwrap_or(p.exposure_time);
                    self.observer.on_event(&ExecutionEvent::ExposureProgress {
                        number,
                        count,
                        elapsed_secs: (p.exposure_time - remaining).max(0.0),
                    });
                }
                PropertyState::Busy => {
                    in_exposure = true;
                    self.observer.on_event(&ExecutionEvent::ExposureStarted {
                        number,
                        count,
                        exposure_time: p.exposure_time,
                    });
                }
                PropertyState::Alert if in_exposure => {
                    let message = self.client.current_server_message();
                    self.observer.on_event(&ExecutionEvent::ExposureError {
                        message: if message.is_empty() {
                            format!("{} reported a failed exposure", device)
                        } else {
                            message
                        },
                    });
                    self.outputs.lock().error_count += 1;
                    return Ok(false);
                }
                _ if in_exposure => {
                    self.observer
                        .on_event(&ExecutionEvent::ExposureEnded { number });
                    self.outputs.lock().success_count += 1;
                    return Ok(true);
                }
                _ => {
                    if start.elapsed() > Duration::from_secs(1) {
                        self.observer.on_event(&ExecutionEvent::WaitingForServer);
                    }
                }
            }
            sleep(poll_interval).await;
        }
    }

    async fn wait_for_download(&self) -> ExecutionResult<PathBuf> {
        let poll_interval = self.client.config().poll_interval();
        let mut last_report = Instant::now();
        loop {
            if self.abort.is_aborted() {
                return Err(ExecutionError::Aborted);
            }
            if let Some(path) = self.client.downloaded_image_path() {
                return Ok(path);
            }
            if last_report.elapsed() > Duration::from_secs(1) {
                self.observer.on_event(&ExecutionEvent::WaitingForServer);
                last_report = Instant::now();
            }
            sleep(poll_interval).await;
        }
    }

    // =========================================================================
    // FRAME PROCESSING
    // =========================================================================

    async fn process_frame(
        &self,
        p: &CcdFrameParameters,
        number: u32,
        downloaded: &Path,
        pointing: Option<&TelescopePointing>,
    ) -> ExecutionResult<()> {
        let mut image = FitsImage::read(downloaded)?;
        let mut data = ImageMetadata::from_header(&image.header);
        let header = &mut image.header;

        if p.frame_type == FrameType::Light && !p.object_name.is_empty() {
            metadata::set_object_name(header, &p.object_name);
            data.object_name = Some(p.object_name.clone());
        }

        if let Some(pointing) = pointing {
            let telescope = pointing.device.as_str();

            if data.local_sidereal_time.is_none() {
                if let Some(lst) = self.client.get_number(telescope, props::TIME_LST, props::LST) {
                    data.local_sidereal_time = Some(lst);
                    metadata::set_local_sidereal_time(header, lst);
                }
            }

            if data.telescope_pier_side.is_none() {
                let west = self
                    .client
                    .get_property(telescope, props::TELESCOPE_PIER_SIDE, props::PIER_WEST, false)
                    .map(|item| item.is_on());
                data.telescope_pier_side = Some(match west {
                    Some(true) => "WEST".to_string(),
                    Some(false) => "EAST".to_string(),
                    None => "NONE".to_string(),
                });
                if let Some(west) = west {
                    metadata::set_pier_side(header, west);
                }
            }

            // Degrees from here on
            let mut ra = pointing.ra * 15.0;
            let mut dec = pointing.dec;
            if p.enable_alignment_correction {
                tracing::info!("Removing pointing model from {} coordinates", telescope);
                let model = AlignmentModel::create(&p.alignment_file)?;
                let lst = data
                    .local_sidereal_time
                    .ok_or_else(|| ExecutionError::missing(telescope, props::TIME_LST, props::LST))?;
                let side = if data.telescope_pier_side.as_deref() == Some("EAST") {
                    PierSide::East
                } else {
                    PierSide::West
                };
                let (hour_angle, true_dec) =
                    model.apply_inverse(range_shift_hour_angle(lst - ra / 15.0), dec, side)?;
                ra = range_shift_right_ascension(lst - hour_angle) * 15.0;
                dec = true_dec;
            }

            data.telescope_name = Some(telescope.to_string());
            if data.eod_ra.is_none() || data.eod_dec.is_none() {
                data.eod_ra = Some(ra);
                data.eod_dec = Some(dec);
            }

            data.ra = Some(ra);
            data.dec = Some(dec);
            data.equinox = Some(J2000);
            let apparent = match self.client.get_number(telescope, props::EPOCH, props::EPOCH) {
                Some(epoch) => epoch.trunc() == 0.0,
                None => true,
            };
            if apparent {
                if let (Some(time), Some(ephemeris)) = (data.observation_start, &self.ephemeris) {
                    let (gcrs_ra, gcrs_dec) = ephemeris.apparent_to_gcrs(ra, dec, time);
                    data.ra = Some(gcrs_ra);
                    data.dec = Some(gcrs_dec);
                }
            }

            if data.focal_length.is_none() {
                let focal_length = self
                    .client
                    .get_number(telescope, props::TELESCOPE_INFO, props::TELESCOPE_FOCAL_LENGTH)
                    .or((p.telescope_focal_length != 0.0).then_some(p.telescope_focal_length));
                if let Some(millimeters) = focal_length {
                    let millimeters = (millimeters * 1000.0).round() / 1000.0;
                    data.focal_length = Some(millimeters / 1000.0);
                    metadata::set_focal_length(header, millimeters);
                }
            }
        }

        if let (Some(ra), Some(dec)) = (data.ra, data.dec) {
            metadata::set_coordinates(header, ra, dec);
        }

        if let Some(pointing) = pointing {
            let site = |element: &str| {
                self.client
                    .get_number(&pointing.device, props::GEOGRAPHIC_COORD, element)
            };
            if data.geographic_longitude.is_none() {
                data.geographic_longitude = site(props::LONG);
            }
            if data.geographic_latitude.is_none() {
                data.geographic_latitude = site(props::LAT);
            }
            if data.geographic_height.is_none() {
                data.geographic_height = site(props::ELEV);
            }
        }

        if data.filter_name.is_none() {
            data.filter_name = self.current_filter_name(p);
        }

        let properties = image_properties(&data);
        metadata::add_acquisition_history(
            header,
            &format!("skybridge {}", env!("CARGO_PKG_VERSION")),
            "CcdFrame",
        );

        let frame_path = if p.save_client_images {
            let directory = if p.client_download_directory.as_os_str().is_empty() {
                std::env::temp_dir()
            } else {
                p.client_download_directory.clone()
            };
            tokio::fs::create_dir_all(&directory)
                .await
                .map_err(|source| ExecutionError::Io {
                    path: directory.clone(),
                    source,
                })?;
            let mut path = directory.join(format!("{}.fits", self.client_file_name(p, number)));
            if !p.overwrite_client_images {
                path = unique_file_path(path);
            }
            image.write(&path)?;
            tracing::info!("Frame saved: {}", path.display());
            self.outputs.lock().client_file_paths.push(path.clone());
            path
        } else {
            image.write(downloaded)?;
            downloaded.to_path_buf()
        };

        self.observer.on_event(&ExecutionEvent::NewFrame {
            path: frame_path.clone(),
            properties,
        });

        if p.apply_plate_solver {
            self.solve_frame(&frame_path, &p.plate_solver).await;
        }
        Ok(())
    }

    async fn solve_frame(&self, path: &Path, parameters: &PlateSolverParameters) {
        let Some(solver) = &self.plate_solver else {
            tracing::warn!("Plate solving requested but no solver is configured");
            return;
        };
        let solved = match solver.solve(&[path.to_path_buf()], parameters).await {
            Ok(count) => count > 0,
            Err(e) => {
                tracing::warn!("Plate solving {} failed: {}", path.display(), e);
                false
            }
        };
        self.observer.on_event(&ExecutionEvent::PlateSolved {
            path: path.to_path_buf(),
            solved,
        });
    }
}

/// `path`, or the first free `<stem>_<n>.<ext>` next to it
fn unique_file_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1u32..)
        .map(|n| path.with_file_name(format!("{}_{}{}", stem, n, extension)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}
