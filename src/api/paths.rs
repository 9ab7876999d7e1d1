//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}

pub mod cluster {
    pub const STATUS: &str = "/cluster";
    pub const LEADER: &str = "/cluster/leader";
}
