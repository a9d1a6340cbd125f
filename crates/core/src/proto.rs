//! Worker RPC contract, generated from `proto/backend.proto`

#![allow(missing_docs)]
#![allow(clippy::all)]

tonic::include_proto!("backend");
