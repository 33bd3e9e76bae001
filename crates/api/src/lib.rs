//! HTTP surface of the conductor: trigger endpoint, last cycle report and
//! registry views.

pub mod app;
