//! Executes compiled templates against mocked inputs.

pub mod binder;
pub mod builtins;
pub mod context;
pub mod interp;
pub mod value;

pub use binder::bind_permutation;
pub use context::{ExecutionContext, Locals};
pub use interp::render;
pub use value::{MockObject, MockValue, Seed, Value};

use tracing::debug;

use crate::coverage::{CoverageMap, Hits};
use crate::lang::Program;
use crate::model::{Permutation, PermutationOutput, RenderOutcome};

/// Render one permutation in a fresh context: explicit locals first, then
/// the permutation's forced values on top.
pub fn execute_permutation(
    program: &Program,
    map: &CoverageMap,
    locals: &Locals,
    permutation: &Permutation,
) -> (PermutationOutput, Hits) {
    let mut ctx = ExecutionContext::with_locals(locals);
    bind_permutation(&mut ctx, permutation);
    let (result, hits) = render(program, map, &mut ctx);
    debug!(
        permutation = %permutation,
        ok = result.is_ok(),
        mocked = ctx.accessed_mocks().len(),
        "rendered permutation"
    );
    let outcome = match result {
        Ok(output) => RenderOutcome::Rendered { output },
        Err(error) => RenderOutcome::Failed { error },
    };
    (
        PermutationOutput {
            permutation: permutation.clone(),
            outcome,
        },
        hits,
    )
}
