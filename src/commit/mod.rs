pub mod executor;

pub use executor::{
    CompensationQueue, CompensationReport, CreateUserRequest, CreateUserResponse, MutatorRequest,
    MutatorResponse, ResultAccumulator, SweepReport, consented_purposes_for_user,
    create_user_with_mutator, delete_user, execute_mutator, sweep_expired,
};
