pub mod app;
pub mod commit;
pub mod labels;
pub mod preview;
pub mod replace;
pub mod repos;
pub mod scan;
pub mod workflows;
