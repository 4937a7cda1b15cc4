// Core modules implementing record kinds, codecs, archives, counting, and error modeling.
pub mod archive;
pub mod codec;
pub mod counter;
pub mod error;
pub mod kind;
pub mod record;
