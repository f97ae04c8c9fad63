/// Generated types grouped by protobuf package.
pub mod tonic {
    /// `tps.control.v1`
    pub mod control {
        #[allow(missing_docs, clippy::all)]
        pub mod v1 {
            include!("proto/tonic/tps.control.v1.rs");
        }
    }
}
