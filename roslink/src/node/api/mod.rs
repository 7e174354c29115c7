use dxr::{TryFromParams, Value};

mod handler;
pub mod router;
pub mod server;

use handler::{invalid_request, HandlerFailure};

fn get_params<R>(values: &[Value]) -> Result<R, HandlerFailure>
where
    R: TryFromParams,
{
    R::try_from_params(values).map_err(|e| invalid_request(format!("Invalid parameters: {e}")))
}
