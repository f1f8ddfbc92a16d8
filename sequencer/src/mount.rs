//! Mount command execution
//!
//! One [`MountExecution`] drives one mount device. `perform` validates the
//! device, applies the slew rate, reads the current position and runs the
//! configured [`MountCommand`]. Slews and parking are sent asynchronously and
//! then followed by polling the property state, emitting progress events,
//! until the device leaves Busy.
//!
//! GoTo targets may be corrected with a pointing model (true -> raw mount
//! coordinates); sync commands feed new sync points into the model file.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::sleep;

use skybridge_alignment::{
    range_shift_hour_angle, range_shift_right_ascension, read_sync_data_csv, AlignmentModel,
    GeneralAnalyticalPointingModel, ModelConfig, PierSide, SyncDataPoint,
};
use skybridge_imaging::sexagesimal::to_sexagesimal;
use skybridge_indi::{
    standard_properties as props, switch_value, AbortToken, IndiClient, NewPropertyItem,
    PropertyState, PropertyType, SendMode,
};

use crate::guard::RunningGuard;
use crate::{ExecutionError, ExecutionEvent, ExecutionObserver, ExecutionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MountCommand {
    Unpark,
    #[default]
    GoTo,
    Park,
    /// Park at the position stored in the driver
    ParkDefault,
    /// Record a sync point as an unaligned mount would see it
    TestSync,
    Sync,
    MoveNorthStart,
    MoveNorthStop,
    MoveSouthStart,
    MoveSouthStop,
    MoveWestStart,
    MoveWestStop,
    MoveEastStart,
    MoveEastStop,
    FitPointingModel,
}

impl MountCommand {
    /// Motion switch of the manual move commands: (property, element, on)
    fn motion(self) -> Option<(&'static str, &'static str, bool)> {
        use MountCommand::*;
        let ns = props::TELESCOPE_MOTION_NS;
        let we = props::TELESCOPE_MOTION_WE;
        match self {
            MoveNorthStart => Some((ns, props::MOTION_NORTH, true)),
            MoveNorthStop => Some((ns, props::MOTION_NORTH, false)),
            MoveSouthStart => Some((ns, props::MOTION_SOUTH, true)),
            MoveSouthStop => Some((ns, props::MOTION_SOUTH, false)),
            MoveWestStart => Some((we, props::MOTION_WEST, true)),
            MoveWestStop => Some((we, props::MOTION_WEST, false)),
            MoveEastStart => Some((we, props::MOTION_EAST, true)),
            MoveEastStop => Some((we, props::MOTION_EAST, false)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SlewRate {
    Guide,
    Centering,
    Find,
    #[default]
    Max,
}

impl SlewRate {
    pub fn element(self) -> &'static str {
        match self {
            SlewRate::Guide => props::SLEW_GUIDE,
            SlewRate::Centering => props::SLEW_CENTERING,
            SlewRate::Find => props::SLEW_FIND,
            SlewRate::Max => props::SLEW_MAX,
        }
    }
}

/// Where sync points go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AlignmentMethod {
    /// Sync points are collected in the model file
    #[default]
    None,
    /// The driver's own alignment handles syncs
    ServerModel,
    /// General analytical model built from the configured terms
    AnalyticalModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountParameters {
    pub device_name: String,
    pub command: MountCommand,
    pub slew_rate: SlewRate,
    /// Right ascension in hours
    pub target_ra: f64,
    /// Declination in degrees
    pub target_dec: f64,
    pub alignment_method: AlignmentMethod,
    pub alignment_file: PathBuf,
    pub alignment_config: ModelConfig,
    /// Correct GoTo targets with the pointing model
    pub enable_alignment_correction: bool,
    /// CSV sync points to fit instead of the points stored in the model file
    pub sync_data_file: Option<PathBuf>,
}

impl Default for MountParameters {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            command: MountCommand::GoTo,
            slew_rate: SlewRate::Max,
            target_ra: 0.0,
            target_dec: 0.0,
            alignment_method: AlignmentMethod::None,
            alignment_file: PathBuf::new(),
            alignment_config: ModelConfig::default(),
            enable_alignment_correction: false,
            sync_data_file: None,
        }
    }
}

/// What the last run observed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MountState {
    /// Hours
    pub current_ra: Option<f64>,
    /// Degrees
    pub current_dec: Option<f64>,
    pub local_sidereal_time: Option<f64>,
    pub geographic_latitude: Option<f64>,
    pub pier_side: PierSide,
    /// Correction applied to the last GoTo: RA hours, Dec degrees
    pub correction: Option<(f64, f64)>,
}

pub struct MountExecution {
    client: Arc<IndiClient>,
    parameters: Mutex<MountParameters>,
    state: Mutex<MountState>,
    observer: Arc<dyn ExecutionObserver>,
    abort: AbortToken,
    running: AtomicBool,
    aborted: AtomicBool,
    /// A start event went out without its end event
    started: AtomicBool,
}

impl MountExecution {
    pub fn new(
        client: Arc<IndiClient>,
        parameters: MountParameters,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Self {
        let abort = client.abort_token();
        Self {
            client,
            parameters: Mutex::new(parameters),
            state: Mutex::new(MountState::default()),
            observer,
            abort,
            running: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    pub fn parameters(&self) -> MountParameters {
        self.parameters.lock().clone()
    }

    pub fn set_parameters(&self, parameters: MountParameters) {
        *self.parameters.lock() = parameters;
    }

    pub fn state(&self) -> MountState {
        self.state.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True when the last run ended by an abort
    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Request cancellation of the running command.
    ///
    /// The token belongs to the client, so this cancels every execution
    /// sharing it, a CCD series included. The next `perform` re-arms it.
    pub fn abort(&self) {
        if self.is_running() {
            self.abort.abort();
        }
    }

    pub async fn perform(&self) -> ExecutionResult<()> {
        let parameters = self.parameters();
        self.perform_with(&parameters).await
    }

    /// Shift the current target by `pointing - center` of a solved image and
    /// slew there. Coordinates are RA hours and Dec degrees. Returns
    /// Ok(false) when the observer declines a meridian crossing. The stored
    /// parameters are left untouched.
    pub async fn perform_differential_correction(
        &self,
        pointing_ra: f64,
        pointing_dec: f64,
        center_ra: f64,
        center_dec: f64,
    ) -> ExecutionResult<bool> {
        if self.is_running() {
            return Err(ExecutionError::Recursive);
        }
        let parameters = self.parameters();
        let device = parameters.device_name.as_str();
        if device.is_empty() {
            return Err(ExecutionError::NoDevice);
        }
        self.validate_device(device)?;
        let (current_ra, _) = self.update_current_coordinates(device)?;

        let delta_ra = range_shift_hour_angle(pointing_ra - center_ra);
        let delta_dec = pointing_dec - center_dec;

        let lst = self.state.lock().local_sidereal_time;
        if let Some(lst) = lst {
            let current_hour_angle = range_shift_hour_angle(lst - current_ra);
            let new_hour_angle = current_hour_angle - delta_ra;
            if (current_hour_angle < 0.0) != (new_hour_angle < 0.0)
                && !self
                    .observer
                    .confirm_meridian_crossing(current_hour_angle, new_hour_angle)
            {
                tracing::info!("Differential correction declined at the meridian");
                return Ok(false);
            }
        }

        tracing::info!(
            "Applying differential correction: dRA = {}, dDec = {}",
            to_sexagesimal(delta_ra, 3, true, ':'),
            to_sexagesimal(delta_dec, 3, true, ':')
        );
        let corrected = MountParameters {
            command: MountCommand::GoTo,
            target_ra: range_shift_right_ascension(parameters.target_ra + delta_ra),
            target_dec: parameters.target_dec + delta_dec,
            ..parameters
        };
        self.perform_with(&corrected).await?;
        Ok(true)
    }

    async fn perform_with(&self, parameters: &MountParameters) -> ExecutionResult<()> {
        let _running = RunningGuard::acquire(&self.running)?;
        if parameters.device_name.is_empty() {
            return Err(ExecutionError::NoDevice);
        }
        if !self.client.has_devices() {
            return Err(ExecutionError::NoDevicesConnected);
        }

        self.abort.reset();
        self.aborted.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);

        match self.run(parameters).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_aborted() => {
                self.aborted.store(true, Ordering::SeqCst);
                self.finish_sequence();
                let request = NewPropertyItem::switch_on(
                    &parameters.device_name,
                    props::TELESCOPE_ABORT_MOTION,
                    props::ABORT,
                );
                if let Err(e) = self
                    .client
                    .maybe_send_new_property_item(&request, SendMode::Async)
                    .await
                {
                    tracing::warn!("Abort motion request failed: {}", e);
                }
                self.observer.on_event(&ExecutionEvent::Aborted);
                Err(ExecutionError::Aborted)
            }
            Err(e) => {
                tracing::error!("Mount command {:?} failed: {}", parameters.command, e);
                self.finish_sequence();
                Err(e)
            }
        }
    }

    async fn run(&self, p: &MountParameters) -> ExecutionResult<()> {
        let device = p.device_name.as_str();
        self.validate_device(device)?;
        self.send_device_properties(p).await?;
        self.update_current_coordinates(device)?;

        use MountCommand::*;
        match p.command {
            Unpark => {
                let request = NewPropertyItem::switch_on(device, props::TELESCOPE_PARK, props::UNPARK);
                self.client
                    .maybe_send_new_property_item(&request, SendMode::Sync)
                    .await?;
            }
            GoTo => self.goto(p).await?,
            Park => self.park(p).await?,
            ParkDefault => self.park_default(p).await?,
            TestSync => self.test_sync(p)?,
            Sync => self.sync(p).await?,
            MoveNorthStart | MoveNorthStop | MoveSouthStart | MoveSouthStop | MoveWestStart
            | MoveWestStop | MoveEastStart | MoveEastStop => self.move_axis(p).await?,
            FitPointingModel => self.fit_pointing_model(p)?,
        }
        Ok(())
    }

    // =========================================================================
    // DEVICE STATE
    // =========================================================================

    fn validate_device(&self, device: &str) -> ExecutionResult<()> {
        if !self.client.has_device(device) {
            return Err(ExecutionError::DeviceUnavailable(device.to_string()));
        }
        if !self
            .client
            .has_element(device, props::EQUATORIAL_EOD_COORD, props::RA)
        {
            return Err(ExecutionError::NotAMount(device.to_string()));
        }
        Ok(())
    }

    async fn send_device_properties(&self, p: &MountParameters) -> ExecutionResult<()> {
        let request = NewPropertyItem::switch_on(
            &p.device_name,
            props::TELESCOPE_SLEW_RATE,
            p.slew_rate.element(),
        );
        self.client
            .maybe_send_new_property_item(&request, SendMode::Sync)
            .await?;
        Ok(())
    }

    /// Read RA/Dec (required), LST and latitude (when exposed)
    fn update_current_coordinates(&self, device: &str) -> ExecutionResult<(f64, f64)> {
        let eod = props::EQUATORIAL_EOD_COORD;
        let ra = self
            .client
            .get_number(device, eod, props::RA)
            .ok_or_else(|| ExecutionError::missing(device, eod, props::RA))?;
        let dec = self
            .client
            .get_number(device, eod, props::DEC)
            .ok_or_else(|| ExecutionError::missing(device, eod, props::DEC))?;
        let lst = self.client.get_number(device, props::TIME_LST, props::LST);
        let latitude = self
            .client
            .get_number(device, props::GEOGRAPHIC_COORD, props::LAT);

        let mut state = self.state.lock();
        state.current_ra = Some(ra);
        state.current_dec = Some(dec);
        if lst.is_some() {
            state.local_sidereal_time = lst;
        }
        if latitude.is_some() {
            state.geographic_latitude = latitude;
        }
        Ok((ra, dec))
    }

    fn require_lst(&self, device: &str) -> ExecutionResult<f64> {
        self.state
            .lock()
            .local_sidereal_time
            .ok_or_else(|| ExecutionError::missing(device, props::TIME_LST, props::LST))
    }

    /// Side reported by TELESCOPE_PIER_SIDE, None when the driver has no
    /// such property or reports neither side
    fn device_pier_side(&self, device: &str) -> Option<PierSide> {
        let west = self
            .client
            .get_property(device, props::TELESCOPE_PIER_SIDE, props::PIER_WEST, false)?;
        let east = self
            .client
            .get_property(device, props::TELESCOPE_PIER_SIDE, props::PIER_EAST, false)?;
        if west.is_on() {
            Some(PierSide::West)
        } else if east.is_on() {
            Some(PierSide::East)
        } else {
            None
        }
    }

    /// Device-reported side, else the hour-angle fallback of the current position
    fn update_pier_side(&self, device: &str) -> PierSide {
        let side = match self.device_pier_side(device) {
            Some(side) => side,
            None => {
                let state = self.state.lock();
                match (state.local_sidereal_time, state.current_ra) {
                    (Some(lst), Some(ra)) => PierSide::from_hour_angle(lst - ra),
                    _ => PierSide::None,
                }
            }
        };
        self.state.lock().pier_side = side;
        side
    }

    fn force_counterweight_up(&self, device: &str) -> bool {
        self.client
            .get_property(device, props::FORCECWUP, props::ENABLE, false)
            .is_some_and(|item| item.is_on())
    }

    fn general_model(&self, p: &MountParameters) -> AlignmentModel {
        let latitude = self.state.lock().geographic_latitude.unwrap_or_else(|| {
            tracing::warn!("{} reports no geographic latitude, using 0", p.device_name);
            0.0
        });
        AlignmentModel::General(GeneralAnalyticalPointingModel::new(
            latitude,
            p.alignment_config,
        ))
    }

    fn load_correction_model(&self, p: &MountParameters) -> ExecutionResult<AlignmentModel> {
        match p.alignment_method {
            AlignmentMethod::AnalyticalModel => {
                let mut model = self.general_model(p);
                model.read_object(&p.alignment_file)?;
                Ok(model)
            }
            _ => Ok(AlignmentModel::create(&p.alignment_file)?),
        }
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    fn start_event(&self, command: MountCommand, target_ra: f64, target_dec: f64) {
        let (current_ra, current_dec) = {
            let state = self.state.lock();
            (
                state.current_ra.unwrap_or_default(),
                state.current_dec.unwrap_or_default(),
            )
        };
        self.started.store(true, Ordering::SeqCst);
        self.observer.on_event(&ExecutionEvent::MountStarted {
            command,
            target_ra,
            current_ra,
            target_dec,
            current_dec,
        });
    }

    fn end_event(&self, device: &str) -> ExecutionResult<()> {
        self.update_current_coordinates(device)?;
        self.finish_sequence();
        Ok(())
    }

    /// MountEnded for a started sequence, once, whatever the outcome
    fn finish_sequence(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.observer.on_event(&ExecutionEvent::MountEnded);
        }
    }

    /// Poll until none of `elements` is Busy, reporting the position
    async fn wait_while_busy(
        &self,
        device: &str,
        property: &str,
        elements: &[&str],
        target: (f64, f64),
    ) -> ExecutionResult<()> {
        let poll_interval = self.client.config().poll_interval();
        loop {
            if self.abort.is_aborted() {
                return Err(ExecutionError::Aborted);
            }

            let mut busy = false;
            for element in elements {
                let item = self
                    .client
                    .get_property(device, property, element, false)
                    .ok_or_else(|| ExecutionError::missing(device, property, element))?;
                busy |= item.state == PropertyState::Busy;
            }
            if !busy {
                return Ok(());
            }

            let eod = props::EQUATORIAL_EOD_COORD;
            let current_ra = self.client.get_number(device, eod, props::RA).unwrap_or_default();
            let current_dec = self.client.get_number(device, eod, props::DEC).unwrap_or_default();
            {
                let mut state = self.state.lock();
                state.current_ra = Some(current_ra);
                state.current_dec = Some(current_dec);
            }
            self.observer.on_event(&ExecutionEvent::MountProgress {
                target_ra: target.0,
                current_ra,
                target_dec: target.1,
                current_dec,
            });

            sleep(poll_interval).await;
        }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    async fn goto(&self, p: &MountParameters) -> ExecutionResult<()> {
        let device = p.device_name.as_str();
        let (target_ra, target_dec) = if p.enable_alignment_correction {
            let model = self.load_correction_model(p)?;
            let lst = self.require_lst(device)?;
            let hour_angle = range_shift_hour_angle(lst - p.target_ra);
            let side = GeneralAnalyticalPointingModel::pier_side_from_hour_angle(
                hour_angle,
                self.force_counterweight_up(device),
            );
            let (raw_hour_angle, raw_dec) = model.apply(hour_angle, p.target_dec, side)?;
            let raw_ra = range_shift_right_ascension(lst - raw_hour_angle);

            let delta_ra = range_shift_hour_angle(raw_ra - p.target_ra);
            let delta_dec = raw_dec - p.target_dec;
            tracing::info!(
                "Applying pointing model correction: dRA = {}, dDec = {}",
                to_sexagesimal(delta_ra, 3, true, ':'),
                to_sexagesimal(delta_dec, 3, true, ':')
            );
            self.state.lock().correction = Some((delta_ra, delta_dec));
            (raw_ra, raw_dec)
        } else {
            (p.target_ra, p.target_dec)
        };

        self.start_event(p.command, target_ra, target_dec);
        self.client
            .send_numbers(
                device,
                props::EQUATORIAL_EOD_COORD,
                &[(props::RA, target_ra), (props::DEC, target_dec)],
                SendMode::Async,
            )
            .await?;
        self.wait_while_busy(
            device,
            props::EQUATORIAL_EOD_COORD,
            &[props::RA, props::DEC],
            (target_ra, target_dec),
        )
        .await?;
        self.end_event(device)
    }

    async fn park(&self, p: &MountParameters) -> ExecutionResult<()> {
        let device = p.device_name.as_str();
        self.start_event(p.command, p.target_ra, p.target_dec);

        let lst = self.state.lock().local_sidereal_time;
        match lst {
            Some(lst) => {
                let request = NewPropertyItem::numbers(
                    device,
                    props::TELESCOPE_PARK_POSITION,
                    &[
                        (props::PARK_HA, range_shift_hour_angle(lst - p.target_ra)),
                        (props::PARK_DEC, p.target_dec),
                    ],
                );
                self.client
                    .maybe_send_new_property_item(&request, SendMode::Async)
                    .await?;
            }
            None => tracing::warn!(
                "{} reports no sidereal time, keeping the stored park position",
                device
            ),
        }

        self.client
            .send_switch_on(device, props::TELESCOPE_PARK, props::PARK, SendMode::Async)
            .await?;
        self.wait_while_busy(
            device,
            props::TELESCOPE_PARK,
            &[props::PARK],
            (p.target_ra, p.target_dec),
        )
        .await?;
        self.end_event(device)
    }

    async fn park_default(&self, p: &MountParameters) -> ExecutionResult<()> {
        let device = p.device_name.as_str();
        let position = props::TELESCOPE_PARK_POSITION;
        let park_ha = self
            .client
            .get_number(device, position, props::PARK_HA)
            .unwrap_or_default();
        let park_dec = self
            .client
            .get_number(device, position, props::PARK_DEC)
            .unwrap_or_default();
        let park_ra = {
            let state = self.state.lock();
            match state.local_sidereal_time {
                Some(lst) => range_shift_right_ascension(lst - park_ha),
                None => state.current_ra.unwrap_or_default(),
            }
        };

        self.start_event(p.command, park_ra, park_dec);
        self.client
            .send_switch_on(device, props::TELESCOPE_PARK, props::PARK, SendMode::Async)
            .await?;
        self.wait_while_busy(
            device,
            props::TELESCOPE_PARK,
            &[props::PARK],
            (park_ra, park_dec),
        )
        .await?;
        self.end_event(device)
    }

    /// Apply the stored model to the target and record the result as the
    /// position an unaligned mount would report
    fn test_sync(&self, p: &MountParameters) -> ExecutionResult<()> {
        if p.alignment_method != AlignmentMethod::AnalyticalModel {
            return Err(ExecutionError::InvalidParameter(
                "TestSync requires the analytical pointing model".to_string(),
            ));
        }
        let device = p.device_name.as_str();
        let lst = self.require_lst(device)?;
        let mut model = self.general_model(p);
        model.read_object(&p.alignment_file)?;

        let side = self.update_pier_side(device);
        let (raw_hour_angle, raw_dec) = model.apply(
            range_shift_hour_angle(lst - p.target_ra),
            p.target_dec,
            side,
        )?;
        let raw_ra = range_shift_right_ascension(lst - raw_hour_angle);

        self.start_event(p.command, p.target_ra, p.target_dec);
        model.add_sync_data_point(SyncDataPoint::new(
            lst,
            p.target_ra,
            p.target_dec,
            raw_ra,
            raw_dec,
            side,
        ));
        model.write_object(&p.alignment_file)?;
        self.end_event(device)
    }

    async fn sync(&self, p: &MountParameters) -> ExecutionResult<()> {
        let device = p.device_name.as_str();
        let (current_ra, current_dec) = self.update_current_coordinates(device)?;
        let side = self.update_pier_side(device);

        self.start_event(p.command, p.target_ra, p.target_dec);
        match p.alignment_method {
            AlignmentMethod::ServerModel => {
                self.client
                    .send_switch_on(device, props::ON_COORD_SET, props::SYNC, SendMode::Sync)
                    .await?;
                self.client
                    .send_numbers(
                        device,
                        props::EQUATORIAL_EOD_COORD,
                        &[(props::RA, p.target_ra), (props::DEC, p.target_dec)],
                        SendMode::Sync,
                    )
                    .await?;
                self.client
                    .send_switch_on(device, props::ON_COORD_SET, props::TRACK, SendMode::Sync)
                    .await?;
            }
            AlignmentMethod::AnalyticalModel | AlignmentMethod::None => {
                self.record_sync_point(p, current_ra, current_dec, side)?;
            }
        }
        self.end_event(device)
    }

    /// Append a sync point to the model file, starting a general model when
    /// the file does not exist yet
    fn record_sync_point(
        &self,
        p: &MountParameters,
        telescope_ra: f64,
        telescope_dec: f64,
        side: PierSide,
    ) -> ExecutionResult<()> {
        let lst = self.require_lst(&p.device_name)?;
        let point = SyncDataPoint::new(lst, p.target_ra, p.target_dec, telescope_ra, telescope_dec, side);

        let mut model = if p.alignment_file.exists() {
            AlignmentModel::create(&p.alignment_file)?
        } else {
            tracing::info!("Starting new pointing model file {}", p.alignment_file.display());
            self.general_model(p)
        };
        model.add_sync_data_point(point);
        model.write_object(&p.alignment_file)?;
        tracing::info!(
            "Sync point {} added to {}",
            model.sync_points().len(),
            p.alignment_file.display()
        );
        Ok(())
    }

    async fn move_axis(&self, p: &MountParameters) -> ExecutionResult<()> {
        let (property, element, on) = p.command.motion().ok_or_else(|| {
            ExecutionError::InvalidParameter(format!("{:?} is not a motion command", p.command))
        })?;
        let device = p.device_name.as_str();
        self.start_event(p.command, p.target_ra, p.target_dec);
        self.client
            .send_new_property_value(
                device,
                property,
                PropertyType::Switch,
                element,
                if on { switch_value::ON } else { switch_value::OFF },
                SendMode::Async,
            )
            .await?;
        self.end_event(device)
    }

    fn fit_pointing_model(&self, p: &MountParameters) -> ExecutionResult<()> {
        if p.alignment_method != AlignmentMethod::AnalyticalModel {
            return Err(ExecutionError::InvalidParameter(
                "fitting requires the analytical pointing model".to_string(),
            ));
        }
        let points = match &p.sync_data_file {
            Some(csv) => read_sync_data_csv(csv)?,
            None => AlignmentModel::read_sync_data(&p.alignment_file)?,
        };
        let mut model = self.general_model(p);
        for point in points {
            model.add_sync_data_point(point);
        }
        model.refit(PierSide::None)?;
        model.write_object(&p.alignment_file)?;
        model.print_parameters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::drain;
    use crate::ChannelObserver;
    use skybridge_indi::testing::MockTransport;
    use skybridge_indi::{ElementSnapshot, IndiClientConfig, PropertyVector, TransportEvent};
    use std::time::Duration;

    const MOUNT: &str = "Telescope Simulator";
    const LST: f64 = 6.0;

    fn number_vector(property: &str, elements: &[(&str, f64)]) -> TransportEvent {
        let vector = elements.iter().fold(
            PropertyVector::new(MOUNT, property, PropertyType::Number).with_state(PropertyState::Ok),
            |v, (name, value)| v.with_element(ElementSnapshot::new(name, &value.to_string())),
        );
        TransportEvent::PropertyDefined(vector)
    }

    fn switch_vector(property: &str, elements: &[(&str, bool)]) -> TransportEvent {
        let vector = elements.iter().fold(
            PropertyVector::new(MOUNT, property, PropertyType::Switch).with_state(PropertyState::Ok),
            |v, (name, on)| {
                v.with_element(ElementSnapshot::new(
                    name,
                    if *on { switch_value::ON } else { switch_value::OFF },
                ))
            },
        );
        TransportEvent::PropertyDefined(vector)
    }

    /// The request's own values with the given state
    fn echo(request: &NewPropertyItem, state: PropertyState) -> TransportEvent {
        let vector = request.elements.iter().fold(
            PropertyVector::new(&request.device, &request.property, request.property_type)
                .with_state(state),
            |v, e| v.with_element(ElementSnapshot::new(&e.element, &e.value)),
        );
        TransportEvent::PropertyUpdated(vector)
    }

    /// Slews and parking go Busy then Ok, everything else settles at once
    fn simulator(request: &NewPropertyItem) -> Vec<(Duration, TransportEvent)> {
        match request.property.as_str() {
            props::EQUATORIAL_EOD_COORD | props::TELESCOPE_PARK => vec![
                (Duration::from_millis(5), echo(request, PropertyState::Busy)),
                (Duration::from_millis(40), echo(request, PropertyState::Ok)),
            ],
            _ => vec![(Duration::from_millis(5), echo(request, PropertyState::Ok))],
        }
    }

    async fn mount_client(transport: &Arc<MockTransport>) -> Arc<IndiClient> {
        let client = Arc::new(IndiClient::new(
            transport.clone(),
            IndiClientConfig {
                property_poll_interval_ms: 10,
                ..Default::default()
            },
        ));
        client.connect().await.unwrap();
        for event in [
            number_vector(props::EQUATORIAL_EOD_COORD, &[(props::RA, 2.0), (props::DEC, 10.0)]),
            number_vector(props::TIME_LST, &[(props::LST, LST)]),
            number_vector(props::GEOGRAPHIC_COORD, &[(props::LAT, 48.0)]),
            number_vector(
                props::TELESCOPE_PARK_POSITION,
                &[(props::PARK_HA, 3.0), (props::PARK_DEC, 89.0)],
            ),
            switch_vector(props::TELESCOPE_PARK, &[(props::PARK, false), (props::UNPARK, true)]),
            switch_vector(
                props::TELESCOPE_SLEW_RATE,
                &[(props::SLEW_GUIDE, false), (props::SLEW_MAX, true)],
            ),
            switch_vector(
                props::TELESCOPE_MOTION_NS,
                &[(props::MOTION_NORTH, false), (props::MOTION_SOUTH, false)],
            ),
            switch_vector(props::TELESCOPE_ABORT_MOTION, &[(props::ABORT, false)]),
            switch_vector(props::ON_COORD_SET, &[(props::TRACK, true), (props::SYNC, false)]),
        ] {
            transport.push(event).await;
        }
        transport.settle().await;
        client
    }

    fn execution(
        client: &Arc<IndiClient>,
        parameters: MountParameters,
    ) -> (Arc<MountExecution>, tokio::sync::broadcast::Receiver<ExecutionEvent>) {
        let observer = Arc::new(ChannelObserver::new(1024));
        let rx = observer.subscribe();
        (
            Arc::new(MountExecution::new(client.clone(), parameters, observer)),
            rx,
        )
    }

    fn temp_model_path() -> PathBuf {
        std::env::temp_dir().join(format!("pointing_{}.json", uuid::Uuid::new_v4()))
    }

    fn goto(ra: f64, dec: f64) -> MountParameters {
        MountParameters {
            device_name: MOUNT.to_string(),
            command: MountCommand::GoTo,
            target_ra: ra,
            target_dec: dec,
            ..Default::default()
        }
    }

    fn coordinate_request(transport: &MockTransport) -> (f64, f64) {
        let sent = transport.sent_for(props::EQUATORIAL_EOD_COORD);
        let request = sent.last().unwrap();
        let value = |name: &str| {
            request
                .elements
                .iter()
                .find(|e| e.element == name)
                .unwrap()
                .value
                .parse::<f64>()
                .unwrap()
        };
        (value(props::RA), value(props::DEC))
    }

    #[tokio::test]
    async fn test_goto_sends_coordinates_in_one_request_and_waits() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, mut rx) = execution(&client, goto(5.5, 20.0));

        mount.perform().await.unwrap();

        let sent = transport.sent_for(props::EQUATORIAL_EOD_COORD);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].elements.len(), 2);
        assert_eq!(coordinate_request(&transport), (5.5, 20.0));
        assert_eq!(transport.sent_for(props::TELESCOPE_SLEW_RATE).len(), 1);

        let events = drain(&mut rx);
        assert!(matches!(
            events.first(),
            Some(ExecutionEvent::MountStarted { command: MountCommand::GoTo, .. })
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::MountProgress { .. })));
        assert_eq!(events.last(), Some(&ExecutionEvent::MountEnded));

        let state = mount.state();
        assert_eq!(state.current_ra, Some(5.5));
        assert_eq!(state.local_sidereal_time, Some(LST));
        assert!(!mount.is_running());
    }

    #[tokio::test]
    async fn test_goto_applies_pointing_model() {
        // Mount reports 0.01 h west and 0.02 deg north of the true position
        let path = temp_model_path();
        let mut model = AlignmentModel::General(GeneralAnalyticalPointingModel::new(
            48.0,
            ModelConfig::OFFSETS,
        ));
        for (ra, dec) in [(4.0, 10.0), (7.0, 30.0), (9.0, -10.0), (3.0, 50.0)] {
            model.add_sync_data_point(SyncDataPoint::new(
                LST,
                ra,
                dec,
                ra - 0.01,
                dec + 0.02,
                PierSide::None,
            ));
        }
        model.refit(PierSide::None).unwrap();
        model.write_object(&path).unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, _rx) = execution(
            &client,
            MountParameters {
                alignment_method: AlignmentMethod::AnalyticalModel,
                alignment_file: path.clone(),
                alignment_config: ModelConfig::OFFSETS,
                enable_alignment_correction: true,
                ..goto(5.0, 20.0)
            },
        );

        mount.perform().await.unwrap();
        std::fs::remove_file(&path).ok();

        let (ra, dec) = coordinate_request(&transport);
        assert!((ra - 4.99).abs() < 1e-6, "ra = {}", ra);
        assert!((dec - 20.02).abs() < 1e-6, "dec = {}", dec);
        let (delta_ra, delta_dec) = mount.state().correction.unwrap();
        assert!((delta_ra + 0.01).abs() < 1e-6);
        assert!((delta_dec - 0.02).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_failed_slew_still_ends_the_sequence() {
        // The driver drops the coordinate vector in the middle of the slew
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(|request| {
            let ms = Duration::from_millis;
            if request.property == props::EQUATORIAL_EOD_COORD {
                vec![
                    (ms(5), echo(request, PropertyState::Busy)),
                    (
                        ms(35),
                        TransportEvent::PropertyRemoved {
                            device: MOUNT.to_string(),
                            property: Some(props::EQUATORIAL_EOD_COORD.to_string()),
                        },
                    ),
                ]
            } else {
                vec![(ms(5), echo(request, PropertyState::Ok))]
            }
        });
        let client = mount_client(&transport).await;
        let (mount, mut rx) = execution(&client, goto(5.5, 20.0));

        let result = mount.perform().await;
        assert!(matches!(result, Err(ExecutionError::MissingProperty { .. })));
        assert!(!mount.was_aborted());

        let events = drain(&mut rx);
        assert!(matches!(
            events.first(),
            Some(ExecutionEvent::MountStarted { command: MountCommand::GoTo, .. })
        ));
        assert_eq!(events.last(), Some(&ExecutionEvent::MountEnded));
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == ExecutionEvent::MountEnded)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_validation_failure_emits_no_sequence_events() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, mut rx) = execution(
            &client,
            MountParameters {
                device_name: "Missing Mount".to_string(),
                ..goto(5.5, 20.0)
            },
        );

        assert!(matches!(
            mount.perform().await,
            Err(ExecutionError::DeviceUnavailable(_))
        ));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_abort_sends_abort_motion() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(|request| {
            if request.property == props::EQUATORIAL_EOD_COORD {
                vec![(Duration::from_millis(5), echo(request, PropertyState::Busy))]
            } else {
                vec![(Duration::from_millis(5), echo(request, PropertyState::Ok))]
            }
        });
        let client = mount_client(&transport).await;
        let (mount, mut rx) = execution(&client, goto(5.5, 20.0));

        let running = mount.clone();
        let task = tokio::spawn(async move { running.perform().await });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(mount.is_running());
        assert!(matches!(
            mount.perform().await,
            Err(ExecutionError::Recursive)
        ));

        mount.abort();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ExecutionError::Aborted)));
        assert!(mount.was_aborted());
        assert!(!mount.is_running());

        let aborts = transport.sent_for(props::TELESCOPE_ABORT_MOTION);
        assert_eq!(aborts.len(), 1);
        assert_eq!(aborts[0].elements[0].element, props::ABORT);
        let events = drain(&mut rx);
        assert_eq!(
            &events[events.len() - 2..],
            &[ExecutionEvent::MountEnded, ExecutionEvent::Aborted]
        );
    }

    #[tokio::test]
    async fn test_device_validation() {
        let transport = Arc::new(MockTransport::new());
        let client = mount_client(&transport).await;

        let (mount, _rx) = execution(&client, MountParameters::default());
        assert!(matches!(mount.perform().await, Err(ExecutionError::NoDevice)));

        let (mount, _rx) = execution(
            &client,
            MountParameters {
                device_name: "Dome Simulator".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(
            mount.perform().await,
            Err(ExecutionError::DeviceUnavailable(_))
        ));

        transport
            .push(TransportEvent::PropertyDefined(
                PropertyVector::new("CCD Simulator", props::CCD_FRAME, PropertyType::Number)
                    .with_element(ElementSnapshot::new(props::CCD_FRAME_WIDTH, "1280")),
            ))
            .await;
        transport.settle().await;
        let (mount, _rx) = execution(
            &client,
            MountParameters {
                device_name: "CCD Simulator".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(mount.perform().await, Err(ExecutionError::NotAMount(_))));
    }

    #[tokio::test]
    async fn test_no_devices() {
        let transport = Arc::new(MockTransport::new());
        let client = Arc::new(IndiClient::new(transport.clone(), IndiClientConfig::default()));
        client.connect().await.unwrap();
        let (mount, _rx) = execution(&client, goto(1.0, 2.0));
        assert!(matches!(
            mount.perform().await,
            Err(ExecutionError::NoDevicesConnected)
        ));
    }

    #[tokio::test]
    async fn test_park_sends_position_then_park() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, mut rx) = execution(
            &client,
            MountParameters {
                command: MountCommand::Park,
                ..goto(4.0, 80.0)
            },
        );

        mount.perform().await.unwrap();

        let position = transport.sent_for(props::TELESCOPE_PARK_POSITION);
        assert_eq!(position.len(), 1);
        assert_eq!(position[0].elements[0].element, props::PARK_HA);
        assert_eq!(position[0].elements[0].value.parse::<f64>().unwrap(), LST - 4.0);
        let park = transport.sent_for(props::TELESCOPE_PARK);
        assert_eq!(park.len(), 1);
        assert_eq!(park[0].elements[0].element, props::PARK);
        assert_eq!(drain(&mut rx).last(), Some(&ExecutionEvent::MountEnded));
    }

    #[tokio::test]
    async fn test_park_default_uses_driver_position() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, mut rx) = execution(
            &client,
            MountParameters {
                command: MountCommand::ParkDefault,
                ..goto(0.0, 0.0)
            },
        );

        mount.perform().await.unwrap();

        assert!(transport.sent_for(props::TELESCOPE_PARK_POSITION).is_empty());
        match drain(&mut rx).first() {
            Some(ExecutionEvent::MountStarted {
                target_ra,
                target_dec,
                ..
            }) => {
                assert_eq!(*target_ra, LST - 3.0);
                assert_eq!(*target_dec, 89.0);
            }
            other => panic!("unexpected first event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unpark_and_moves() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;

        let (mount, _rx) = execution(
            &client,
            MountParameters {
                command: MountCommand::Unpark,
                ..goto(0.0, 0.0)
            },
        );
        mount.perform().await.unwrap();
        assert_eq!(
            transport.sent_for(props::TELESCOPE_PARK)[0].elements[0].element,
            props::UNPARK
        );

        for (command, value) in [
            (MountCommand::MoveNorthStart, switch_value::ON),
            (MountCommand::MoveNorthStop, switch_value::OFF),
        ] {
            mount.set_parameters(MountParameters {
                command,
                ..goto(0.0, 0.0)
            });
            mount.perform().await.unwrap();
            let sent = transport.sent_for(props::TELESCOPE_MOTION_NS);
            let request = sent.last().unwrap();
            assert_eq!(request.elements[0].element, props::MOTION_NORTH);
            assert_eq!(request.elements[0].value, value);
        }
    }

    #[tokio::test]
    async fn test_server_sync_sequence() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, _rx) = execution(
            &client,
            MountParameters {
                command: MountCommand::Sync,
                alignment_method: AlignmentMethod::ServerModel,
                ..goto(3.25, 15.0)
            },
        );

        mount.perform().await.unwrap();

        let order: Vec<(String, String)> = transport
            .sent()
            .into_iter()
            .filter(|r| r.property != props::TELESCOPE_SLEW_RATE)
            .map(|r| (r.property, r.elements[0].element.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                (props::ON_COORD_SET.to_string(), props::SYNC.to_string()),
                (props::EQUATORIAL_EOD_COORD.to_string(), props::RA.to_string()),
                (props::ON_COORD_SET.to_string(), props::TRACK.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_sync_points_accumulate_and_fit() {
        let path = temp_model_path();
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, _rx) = execution(&client, goto(0.0, 0.0));

        // The mount sits at (2.0, 10.0); each sync claims a different true target
        for (ra, dec) in [(2.01, 9.98), (2.02, 9.97)] {
            mount.set_parameters(MountParameters {
                command: MountCommand::Sync,
                alignment_method: AlignmentMethod::None,
                alignment_file: path.clone(),
                ..goto(ra, dec)
            });
            mount.perform().await.unwrap();
        }
        let points = AlignmentModel::read_sync_data(&path).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].telescope_ra, 2.0);
        assert_eq!(points[1].celestial_dec, 9.97);
        assert_eq!(points[0].local_sidereal_time, LST);
        // Hour angle +4 h with no reported pier side
        assert_eq!(points[0].pier_side, PierSide::East);

        mount.set_parameters(MountParameters {
            command: MountCommand::FitPointingModel,
            alignment_method: AlignmentMethod::AnalyticalModel,
            alignment_file: path.clone(),
            alignment_config: ModelConfig::OFFSETS,
            ..goto(0.0, 0.0)
        });
        mount.perform().await.unwrap();
        let fitted = AlignmentModel::create(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(fitted.family(), "general");
        assert_eq!(fitted.sync_points().len(), 2);
        assert!(fitted.apply(1.0, 10.0, PierSide::East).is_ok());
    }

    #[tokio::test]
    async fn test_fit_requires_analytical_model() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, _rx) = execution(
            &client,
            MountParameters {
                command: MountCommand::FitPointingModel,
                ..goto(0.0, 0.0)
            },
        );
        assert!(matches!(
            mount.perform().await,
            Err(ExecutionError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_test_sync_records_model_position() {
        let path = temp_model_path();
        let mut model = AlignmentModel::General(GeneralAnalyticalPointingModel::new(
            48.0,
            ModelConfig::OFFSETS,
        ));
        for (ra, dec) in [(4.0, 10.0), (7.0, 30.0), (9.0, -10.0)] {
            model.add_sync_data_point(SyncDataPoint::new(
                LST,
                ra,
                dec,
                ra - 0.05,
                dec,
                PierSide::None,
            ));
        }
        model.refit(PierSide::None).unwrap();
        model.write_object(&path).unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, _rx) = execution(
            &client,
            MountParameters {
                command: MountCommand::TestSync,
                alignment_method: AlignmentMethod::AnalyticalModel,
                alignment_file: path.clone(),
                alignment_config: ModelConfig::OFFSETS,
                ..goto(5.0, 25.0)
            },
        );
        mount.perform().await.unwrap();

        let points = AlignmentModel::read_sync_data(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(points.len(), 4);
        let recorded = &points[3];
        assert_eq!(recorded.celestial_ra, 5.0);
        assert!((recorded.telescope_ra - 4.95).abs() < 1e-6);
        assert!((recorded.telescope_dec - 25.0).abs() < 1e-6);
    }

    struct Decline;

    impl ExecutionObserver for Decline {
        fn on_event(&self, _event: &ExecutionEvent) {}

        fn confirm_meridian_crossing(&self, _current: f64, _new: f64) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_differential_correction() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(simulator);
        let client = mount_client(&transport).await;
        let (mount, _rx) = execution(&client, goto(2.0, 10.0));

        // Image center is 0.1 h east and 0.5 deg south of where the mount points
        let moved = mount
            .perform_differential_correction(2.0, 10.0, 2.1, 9.5)
            .await
            .unwrap();
        assert!(moved);
        let (ra, dec) = coordinate_request(&transport);
        assert!((ra - 1.9).abs() < 1e-9);
        assert!((dec - 10.5).abs() < 1e-9);
        assert_eq!(mount.parameters().target_ra, 2.0);
        assert_eq!(mount.parameters().command, MountCommand::GoTo);

        // Current hour angle is +4 h; a shift of 5 h crosses the meridian
        let declining = MountExecution::new(client.clone(), goto(2.0, 10.0), Arc::new(Decline));
        let sent_before = transport.sent().len();
        let moved = declining
            .perform_differential_correction(7.0, 10.0, 2.0, 10.0)
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(transport.sent().len(), sent_before);
    }

    #[test]
    fn test_parameters_serialize_with_defaults() {
        let parameters: MountParameters =
            serde_json::from_str(r#"{"device_name":"EQMod Mount","command":"Park"}"#).unwrap();
        assert_eq!(parameters.command, MountCommand::Park);
        assert_eq!(parameters.slew_rate, SlewRate::Max);
        assert_eq!(parameters.alignment_config, ModelConfig::ALL);
        assert_eq!(SlewRate::Centering.element(), "SLEW_CENTERING");
    }
}
