//! Generated gRPC stubs for the three REAPI/buildgrid services
//! buildbox-casd exposes (spec §4.F/§6). Built by `build.rs` from
//! `proto/casd.proto`.

tonic::include_proto!("sched_core.casd");
