pub mod common;
pub mod drain;
pub mod fleet_controller;
pub mod fleet_types;
pub mod gameserver_controller;
pub mod gameserver_types;
pub mod gameserverinstance_types;
pub mod gameserverset_controller;
pub mod gameserverset_types;
pub mod ingressprovider;
pub mod instance;
pub mod parallelism;
pub mod pod;
pub mod role;
pub mod role_binding;
pub mod rolling;
pub mod service_account;
pub mod tcpshield;
