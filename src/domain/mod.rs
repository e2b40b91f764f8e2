pub mod aggregate;
pub mod hash;
pub mod reference;
pub mod track;
