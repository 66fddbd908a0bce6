/// Speed of light in vacuum (m.s⁻¹)
pub const SPEED_OF_LIGHT_M_S: f64 = 299_792_458.0;

/// WGS84 earth gravitational constant (m³.s⁻²), GPS ICD value
pub const GPS_MU: f64 = 3.986_005E14;

/// WGS84 earth rotation rate (rad.s⁻¹)
pub const EARTH_ANGULAR_VEL_RAD: f64 = 7.292_115_146_7E-5;

/// Relativistic clock correction constant -2*sqrt(mu)/c² (s.m^-1/2)
pub const RELATIVISTIC_F: f64 = -4.442_807_633E-10;

/// Semicircle to radians
pub const SC2RAD: f64 = std::f64::consts::PI;

/// Seconds in one GPS week
pub const SECONDS_PER_WEEK: f64 = 604_800.0;

/// Pseudo range modulus used in RTCM GPS messages (m)
pub const PRUNIT_GPS: f64 = 299_792.458;
