pub mod ligo;
