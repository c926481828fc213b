pub mod boot;
pub mod rt;
