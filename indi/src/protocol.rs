//! INDI property and element names used by the client and the executions

/// INDI protocol version
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Switch element values
pub mod switch_value {
    pub const ON: &str = "ON";
    pub const OFF: &str = "OFF";
}

/// Standard INDI properties
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    // Camera properties
    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_EXPOSURE_VALUE: &str = "CCD_EXPOSURE_VALUE";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const ABORT: &str = "ABORT";
    pub const CCD_FRAME: &str = "CCD_FRAME";
    pub const CCD_FRAME_WIDTH: &str = "WIDTH";
    pub const CCD_FRAME_TYPE: &str = "CCD_FRAME_TYPE";
    pub const FRAME_LIGHT: &str = "FRAME_LIGHT";
    pub const FRAME_BIAS: &str = "FRAME_BIAS";
    pub const FRAME_DARK: &str = "FRAME_DARK";
    pub const FRAME_FLAT: &str = "FRAME_FLAT";
    pub const CCD_BINNING: &str = "CCD_BINNING";
    pub const HOR_BIN: &str = "HOR_BIN";
    pub const VER_BIN: &str = "VER_BIN";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD_TEMPERATURE_VALUE: &str = "CCD_TEMPERATURE_VALUE";
    pub const UPLOAD_MODE: &str = "UPLOAD_MODE";
    pub const UPLOAD_CLIENT: &str = "UPLOAD_CLIENT";
    pub const UPLOAD_LOCAL: &str = "UPLOAD_LOCAL";
    pub const UPLOAD_BOTH: &str = "UPLOAD_BOTH";
    pub const UPLOAD_SETTINGS: &str = "UPLOAD_SETTINGS";
    pub const UPLOAD_DIR: &str = "UPLOAD_DIR";
    pub const UPLOAD_PREFIX: &str = "UPLOAD_PREFIX";

    // Filter wheel properties
    pub const FILTER_SLOT: &str = "FILTER_SLOT";
    pub const FILTER_SLOT_VALUE: &str = "FILTER_SLOT_VALUE";
    pub const FILTER_NAME: &str = "FILTER_NAME";
    /// Followed by the 1-based slot number
    pub const FILTER_SLOT_NAME_PREFIX: &str = "FILTER_SLOT_NAME_";

    // Mount properties
    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const EQUATORIAL_COORD: &str = "EQUATORIAL_COORD";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";
    pub const TRACK: &str = "TRACK";
    pub const SYNC: &str = "SYNC";
    pub const SLEW: &str = "SLEW";
    pub const TELESCOPE_PARK: &str = "TELESCOPE_PARK";
    pub const PARK: &str = "PARK";
    pub const UNPARK: &str = "UNPARK";
    pub const TELESCOPE_PARK_POSITION: &str = "TELESCOPE_PARK_POSITION";
    pub const PARK_HA: &str = "PARK_HA";
    pub const PARK_DEC: &str = "PARK_DEC";
    pub const TELESCOPE_ABORT_MOTION: &str = "TELESCOPE_ABORT_MOTION";
    pub const TELESCOPE_MOTION_NS: &str = "TELESCOPE_MOTION_NS";
    pub const MOTION_NORTH: &str = "MOTION_NORTH";
    pub const MOTION_SOUTH: &str = "MOTION_SOUTH";
    pub const TELESCOPE_MOTION_WE: &str = "TELESCOPE_MOTION_WE";
    pub const MOTION_WEST: &str = "MOTION_WEST";
    pub const MOTION_EAST: &str = "MOTION_EAST";
    pub const TELESCOPE_SLEW_RATE: &str = "TELESCOPE_SLEW_RATE";
    pub const SLEW_GUIDE: &str = "SLEW_GUIDE";
    pub const SLEW_CENTERING: &str = "SLEW_CENTERING";
    pub const SLEW_FIND: &str = "SLEW_FIND";
    pub const SLEW_MAX: &str = "SLEW_MAX";
    pub const TELESCOPE_PIER_SIDE: &str = "TELESCOPE_PIER_SIDE";
    pub const PIER_WEST: &str = "PIER_WEST";
    pub const PIER_EAST: &str = "PIER_EAST";
    pub const TELESCOPE_INFO: &str = "TELESCOPE_INFO";
    pub const TELESCOPE_FOCAL_LENGTH: &str = "TELESCOPE_FOCAL_LENGTH";
    pub const TIME_LST: &str = "TIME_LST";
    pub const LST: &str = "LST";
    pub const GEOGRAPHIC_COORD: &str = "GEOGRAPHIC_COORD";
    pub const LAT: &str = "LAT";
    pub const LONG: &str = "LONG";
    pub const ELEV: &str = "ELEV";
    pub const EPOCH: &str = "EPOCH";
    pub const FORCECWUP: &str = "FORCECWUP";
    pub const ENABLE: &str = "ENABLE";

    /// Devices a camera driver is bound to
    pub const ACTIVE_DEVICES: &str = "ACTIVE_DEVICES";
    pub const ACTIVE_TELESCOPE: &str = "ACTIVE_TELESCOPE";

    /// Common coordinate elements
    pub const RA: &str = "RA";
    pub const DEC: &str = "DEC";
}
