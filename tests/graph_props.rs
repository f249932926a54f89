use proptest::prelude::*;
use std::sync::Arc;
use vxcore::{
    Context, ContextConfig, CpuTarget, FnKernel, KernelId, ParamDesc, ParamType, Ref, ScalarType,
    ScalarValue, VxError,
};

const U32: ParamType = ParamType::Scalar(ScalarType::U32);

fn context() -> Context {
    let inc = FnKernel::new(
        KernelId(0x600),
        "test.inc",
        vec![ParamDesc::input(U32), ParamDesc::output(U32)],
        |ctx, params| {
            let [Some(input), Some(output)] = params else {
                return Err(VxError::BadParameter("unbound".into()));
            };
            let ScalarValue::U32(v) = ctx.read_scalar(*input)? else {
                return Err(VxError::KernelFailed("expected u32".into()));
            };
            ctx.write_scalar(*output, ScalarValue::U32(v + 1))
        },
    );
    let mut ctx = Context::new(ContextConfig::default());
    ctx.load_target(Arc::new(CpuTarget::new("cpu").with_kernel(inc)))
        .unwrap();
    ctx
}

/// A chain `v0 -> v1 -> ... -> vn` whose nodes are created in `order`.
fn chain(ctx: &mut Context, order: &[usize]) -> (Ref, Vec<Ref>, Vec<Ref>) {
    let graph = ctx.create_graph().unwrap();
    let values: Vec<Ref> = (0..=order.len())
        .map(|_| ctx.create_scalar(ScalarValue::U32(0)).unwrap())
        .collect();
    let kernel = ctx.get_kernel_by_name("test.inc").unwrap();
    let mut nodes = vec![None; order.len()];
    for &i in order {
        let node = ctx
            .create_node_with_parameters(graph, kernel, &[Some(values[i]), Some(values[i + 1])])
            .unwrap();
        nodes[i] = Some(node);
    }
    ctx.release_kernel(kernel).unwrap();
    (graph, values, nodes.into_iter().flatten().collect())
}

fn shuffled_chain() -> impl Strategy<Value = Vec<usize>> {
    (1usize..16).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #[test]
    fn chains_run_in_data_order_whatever_the_creation_order(order in shuffled_chain()) {
        let mut ctx = context();
        let (graph, values, nodes) = chain(&mut ctx, &order);

        ctx.verify_graph(graph).unwrap();
        prop_assert_eq!(ctx.graph_heads(graph).unwrap(), &nodes[..1]);

        ctx.process_graph(graph).unwrap();
        for (i, value) in values.iter().enumerate() {
            prop_assert_eq!(ctx.read_scalar(*value).unwrap(), ScalarValue::U32(i as u32));
        }
    }

    #[test]
    fn reverify_after_mutation_matches_fresh_verify(
        order in shuffled_chain(),
        cut in 0usize..16,
    ) {
        let mut ctx = context();
        let (graph, values, nodes) = chain(&mut ctx, &order);
        ctx.verify_graph(graph).unwrap();

        prop_assume!(nodes.len() >= 2);
        // Rewire a later node to write the chain's first value, closing a cycle.
        let victim = 1 + cut % (nodes.len() - 1);
        ctx.set_parameter_by_index(nodes[victim], 1, Some(values[0])).unwrap();
        prop_assert!(!ctx.is_graph_verified(graph).unwrap());
        let reverified = ctx.verify_graph(graph);

        let mut fresh = context();
        let (fresh_graph, fresh_values, fresh_nodes) = chain(&mut fresh, &order);
        fresh
            .set_parameter_by_index(fresh_nodes[victim], 1, Some(fresh_values[0]))
            .unwrap();
        let first = fresh.verify_graph(fresh_graph);

        prop_assert!(matches!(reverified, Err(VxError::InvalidGraph(_))));
        prop_assert!(matches!(first, Err(VxError::InvalidGraph(_))));
    }

    #[test]
    fn repeated_verification_is_stable(order in shuffled_chain()) {
        let mut ctx = context();
        let (graph, _, _) = chain(&mut ctx, &order);
        ctx.verify_graph(graph).unwrap();
        let heads = ctx.graph_heads(graph).unwrap().to_vec();
        ctx.verify_graph(graph).unwrap();
        prop_assert_eq!(ctx.graph_heads(graph).unwrap(), &heads[..]);
    }
}
