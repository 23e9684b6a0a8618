// Integration tests for Net: construction, pruning, sharing, execution

use std::sync::Arc;

use kiln::nn::{
    DropoutParams, FillerConfig, InnerProductParams, InputParams, LayerConfig, LayerKind, NetConfig,
    ParamSpec, ReluParams,
};
use kiln::prelude::*;
use kiln::{SimulatedDevice, SyncState};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol * a.abs().max(b.abs()).max(1.0)
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (&g, &e)) in got.iter().zip(expected).enumerate() {
        assert!(approx_eq(g, e, tol), "element {i}: got {g}, expected {e}");
    }
}

fn input(tops: &[(&str, &[usize])]) -> LayerConfig {
    let mut layer = LayerConfig::new(
        "input",
        LayerKind::Input(InputParams {
            shape: tops.iter().map(|(_, s)| s.to_vec()).collect(),
        }),
    );
    for (name, _) in tops {
        layer = layer.with_top(*name);
    }
    layer
}

fn inner_product(name: &str, bottom: &str, top: &str, num_output: usize) -> LayerConfig {
    LayerConfig::new(
        name,
        LayerKind::InnerProduct(InnerProductParams {
            num_output,
            weight_filler: FillerConfig::Gaussian { mean: 0.0, std: 1.0 },
            bias_filler: FillerConfig::Gaussian { mean: 0.0, std: 1.0 },
            ..Default::default()
        }),
    )
    .with_bottom(bottom)
    .with_top(top)
}

fn euclidean(name: &str, a: &str, b: &str) -> LayerConfig {
    LayerConfig::new(name, LayerKind::EuclideanLoss)
        .with_bottom(a)
        .with_bottom(b)
}

fn fill_gaussian(net: &Net<f64>, blob: &str, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut t = net.blob_by_name(blob).expect("blob exists");
    t.mutable_data()?.iter_mut().for_each(|v| *v = normal.sample(&mut rng));
    Ok(())
}

fn data_of(net: &Net<f64>, id: TensorId) -> Result<Vec<f64>> {
    Ok(net.tensor(id).data()?.to_vec())
}

fn diff_of(net: &Net<f64>, id: TensorId) -> Result<Vec<f64>> {
    Ok(net.tensor(id).diff()?.to_vec())
}

/// input(data, target) -> ip -> relu -> ip2 -> loss
fn small_net() -> NetConfig {
    NetConfig::new("small")
        .with_layer(input(&[("data", &[4, 6]), ("target", &[4, 2])]))
        .with_layer(inner_product("ip", "data", "hidden", 5))
        .with_layer(
            LayerConfig::new("relu", LayerKind::ReLU(ReluParams::default()))
                .with_bottom("hidden")
                .with_top("hidden"),
        )
        .with_layer(inner_product("ip2", "hidden", "out", 2))
        .with_layer(euclidean("loss", "out", "target"))
}

fn small_with_inputs(seed: u64) -> Result<Net<f64>> {
    let net = Net::<f64>::new(&small_net(), Phase::Train, &mut Context::new(seed))?;
    fill_gaussian(&net, "data", 100)?;
    fill_gaussian(&net, "target", 101)?;
    Ok(net)
}

// Construction tests

#[test]
fn test_blob_and_layer_lookup() -> Result<()> {
    init_logging();
    let net = small_with_inputs(1)?;
    assert_eq!(net.name(), "small");
    assert_eq!(net.phase(), Phase::Train);
    assert_eq!(net.layer_names(), &["input", "ip", "relu", "ip2", "loss"]);
    assert_eq!(net.blob_names(), &["data", "target", "hidden", "out", "(automatic)"]);
    assert!(net.has_blob("hidden"));
    assert!(!net.has_blob("(automatic)"));
    assert!(net.blob_by_name("missing").is_none());
    assert!(net.has_layer("ip2"));
    assert!(!net.has_layer("ip3"));
    assert_eq!(net.layer_by_name("ip2").map(|l| l.type_name()), Some("InnerProduct"));
    assert!(net.layer_by_name("nope").is_none());

    assert_eq!(net.input_blob_names(), vec!["data", "target"]);
    assert_eq!(net.output_blob_names(), vec!["(automatic)"]);
    assert_eq!(net.blob_by_name("out").unwrap().dims(), &[4, 2]);
    assert_eq!(net.blob_by_name("hidden").unwrap().dims(), &[4, 5]);

    // In place: relu reads and writes the same tensor.
    assert_eq!(net.bottom_ids(2), net.top_ids(2));
    assert_eq!(net.params().len(), 4);
    assert_eq!(net.learnable_params().len(), 4);
    assert_eq!(net.param_display_names(), &["0", "1", "0", "1"]);
    Ok(())
}

#[test]
fn test_config_errors() {
    let mut ctx = Context::new(0);
    let build = |config: NetConfig, ctx: &mut Context| Net::<f64>::new(&config, Phase::Train, ctx).map(|_| ());

    let unknown_bottom = NetConfig::new("n")
        .with_layer(input(&[("data", &[2, 3])]))
        .with_layer(inner_product("ip", "nothing", "out", 1));
    assert!(matches!(build(unknown_bottom, &mut ctx), Err(Error::Config(_))));

    let duplicate_top = NetConfig::new("n")
        .with_layer(input(&[("data", &[2, 3])]))
        .with_layer(inner_product("ip", "data", "out", 1))
        .with_layer(inner_product("ip2", "data", "out", 1));
    assert!(matches!(build(duplicate_top, &mut ctx), Err(Error::Config(_))));

    let in_place_ip = NetConfig::new("n")
        .with_layer(input(&[("data", &[2, 3])]))
        .with_layer(inner_product("ip", "data", "data", 3));
    assert!(matches!(build(in_place_ip, &mut ctx), Err(Error::Config(_))));

    let propagate_down = NetConfig::new("n")
        .with_layer(input(&[("a", &[2, 3]), ("b", &[2, 3])]))
        .with_layer(euclidean("loss", "a", "b").with_propagate_down(vec![true]));
    assert!(matches!(build(propagate_down, &mut ctx), Err(Error::Config(_))));

    let duplicate_layer = NetConfig::new("n")
        .with_layer(input(&[("data", &[2, 3])]))
        .with_layer(inner_product("ip", "data", "a", 1))
        .with_layer(inner_product("ip", "data", "b", 1));
    assert!(matches!(build(duplicate_layer, &mut ctx), Err(Error::Config(_))));

    let unknown_type = NetConfig::new("n").with_layer(
        LayerConfig::new(
            "mystery",
            LayerKind::Custom {
                type_name: "Mystery".into(),
                params: serde_json::Value::Null,
            },
        )
        .with_top("x"),
    );
    assert!(build(unknown_type, &mut ctx).is_err());
}

#[test]
fn test_net_from_json() -> Result<()> {
    let json = r#"{
        "name": "json_net",
        "layers": [
            { "name": "input", "kind": { "type": "Input", "shape": [[2, 3], [2, 1]] },
              "top": ["data", "label"] },
            { "name": "ip", "kind": { "type": "InnerProduct", "num_output": 1 },
              "bottom": ["data"], "top": ["ip"] },
            { "name": "loss", "kind": { "type": "EuclideanLoss" }, "bottom": ["ip", "label"] },
            { "name": "probe", "kind": { "type": "Sigmoid" }, "bottom": ["ip"], "top": ["probe"],
              "include": "Test" }
        ],
        "force_backward": false,
        "debug_info": false
    }"#;
    let config: NetConfig = serde_json::from_str(json)?;
    let train = Net::<f32>::new(&config, Phase::Train, &mut Context::new(0))?;
    let test = Net::<f32>::new(&config, Phase::Test, &mut Context::new(0))?;
    assert_eq!(train.layers().len(), 3);
    assert_eq!(test.layers().len(), 4);
    assert!(test.has_blob("probe"));
    Ok(())
}

// Backward pruning tests

#[test]
fn test_backward_pruning() -> Result<()> {
    let frozen = |name: &str| {
        inner_product(name, "data", "h1", 3)
            .with_param(ParamSpec::default().with_lr_mult(0.0))
            .with_param(ParamSpec::default().with_lr_mult(0.0))
    };
    let config = NetConfig::new("pruning")
        .with_layer(input(&[("data", &[2, 4]), ("target", &[2, 1])]))
        .with_layer(frozen("ip1"))
        .with_layer(
            LayerConfig::new("relu", LayerKind::ReLU(ReluParams::default()))
                .with_bottom("h1")
                .with_top("h1"),
        )
        .with_layer(inner_product("ip2", "h1", "out", 1))
        .with_layer(inner_product("side", "data", "side", 2))
        .with_layer(euclidean("loss", "out", "target"));

    let net = Net::<f64>::new(&config, Phase::Train, &mut Context::new(0))?;
    assert_eq!(net.layer_need_backward(), &[false, false, false, true, false, true]);
    assert_eq!(net.bottom_need_backward()[5], vec![true, false]);
    assert_eq!(net.bottom_need_backward()[3], vec![false]);
    assert_eq!(net.blob_need_backward("out"), Some(true));
    assert_eq!(net.blob_need_backward("data"), Some(false));
    assert_eq!(net.blob_need_backward("nope"), None);
    assert_eq!(net.output_blob_names(), vec!["side", "(automatic)"]);

    let forced = Net::<f64>::new(&config.with_force_backward(true), Phase::Train, &mut Context::new(0))?;
    assert!(forced.layer_need_backward().iter().all(|&b| b));
    assert_eq!(forced.bottom_need_backward()[1], vec![true]);
    assert_eq!(forced.blob_need_backward("data"), Some(true));
    Ok(())
}

#[test]
fn test_force_backward_reaches_inputs() -> Result<()> {
    let config = small_net().with_force_backward(true);
    let mut net = Net::<f64>::new(&config, Phase::Train, &mut Context::new(3))?;
    fill_gaussian(&net, "data", 1)?;
    fill_gaussian(&net, "target", 2)?;
    net.forward_backward()?;
    let data = net.blob_id("data").unwrap();
    assert!(diff_of(&net, data)?.iter().any(|&d| d != 0.0));
    Ok(())
}

// Parameter sharing tests

fn two_branch_net(share: bool) -> NetConfig {
    let branch = |name: &str, bottom: &str, top: &str| {
        let layer = inner_product(name, bottom, top, 2);
        if share {
            layer
                .with_param(ParamSpec::named("shared_w"))
                .with_param(ParamSpec::named("shared_b"))
        } else {
            layer
        }
    };
    NetConfig::new("branches")
        .with_layer(input(&[("data1", &[4, 6]), ("data2", &[4, 6]), ("target", &[4, 2])]))
        .with_layer(branch("ip1", "data1", "out1"))
        .with_layer(branch("ip2", "data2", "out2"))
        .with_layer(euclidean("loss1", "out1", "target"))
        .with_layer(euclidean("loss2", "out2", "target"))
}

#[test]
fn test_shared_gradient_is_sum_of_uses() -> Result<()> {
    init_logging();
    let mut shared = Net::<f64>::new(&two_branch_net(true), Phase::Train, &mut Context::new(5))?;
    let mut separate = Net::<f64>::new(&two_branch_net(false), Phase::Train, &mut Context::new(6))?;

    assert_eq!(shared.params().len(), 4);
    assert_eq!(shared.learnable_params().len(), 2);
    assert_eq!(shared.param_owners(), &[None, None, Some(0), Some(1)]);
    assert_eq!(
        shared.layer_by_name("ip1").unwrap().params(),
        shared.layer_by_name("ip2").unwrap().params()
    );
    assert_eq!(separate.learnable_params().len(), 4);

    // Give both nets the same weights and inputs.
    separate.copy_trained_layers_from(&shared.to_record(false)?)?;
    for net in [&shared, &separate] {
        fill_gaussian(net, "data1", 10)?;
        fill_gaussian(net, "data2", 11)?;
        fill_gaussian(net, "target", 12)?;
    }
    let shared_loss = shared.forward_backward()?;
    let separate_loss = separate.forward_backward()?;
    assert!(approx_eq(shared_loss, separate_loss, 1e-12));

    let sp = separate.params().to_vec();
    let shp = shared.learnable_params().to_vec();
    for k in 0..2 {
        let first = diff_of(&separate, sp[k])?;
        let second = diff_of(&separate, sp[k + 2])?;
        let sum: Vec<f64> = first.iter().zip(&second).map(|(a, b)| a + b).collect();
        assert_vec_approx(&diff_of(&shared, shp[k])?, &sum, 1e-10);
    }

    // One update moves the shared tensor once, by the summed gradient.
    let before = data_of(&shared, shp[0])?;
    let grad = diff_of(&shared, shp[0])?;
    shared.update()?;
    let expected: Vec<f64> = before.iter().zip(&grad).map(|(w, g)| w - g).collect();
    assert_vec_approx(&data_of(&shared, shp[0])?, &expected, 1e-12);
    Ok(())
}

#[test]
fn test_shared_shape_mismatch() {
    let config = NetConfig::new("bad_share")
        .with_layer(input(&[("data", &[4, 6])]))
        .with_layer(inner_product("ip1", "data", "a", 2).with_param(ParamSpec::named("w")))
        .with_layer(inner_product("ip2", "data", "b", 3).with_param(ParamSpec::named("w")));
    let result = Net::<f64>::new(&config, Phase::Train, &mut Context::new(0));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_shared_multipliers_follow_owner() -> Result<()> {
    let config = NetConfig::new("mults")
        .with_layer(input(&[("data", &[4, 6])]))
        .with_layer(
            inner_product("ip1", "data", "a", 2)
                .with_param(ParamSpec::named("w").with_lr_mult(1.0).with_decay_mult(0.5))
                .with_param(ParamSpec::named("b").with_lr_mult(2.0).with_decay_mult(0.0)),
        )
        .with_layer(
            inner_product("ip2", "data", "b", 2)
                .with_param(ParamSpec::named("w").with_lr_mult(10.0))
                .with_param(ParamSpec::named("b")),
        );
    let net = Net::<f64>::new(&config, Phase::Train, &mut Context::new(0))?;
    assert_eq!(net.params_lr(), &[1.0, 2.0]);
    assert_eq!(net.params_weight_decay(), &[0.5, 0.0]);
    assert_eq!(net.param_display_names(), &["w", "b", "w", "b"]);
    Ok(())
}

// Execution tests

#[test]
fn test_forward_is_deterministic() -> Result<()> {
    let mut a = small_with_inputs(42)?;
    let mut b = small_with_inputs(42)?;
    let loss_a = a.forward()?;
    let loss_b = b.forward()?;
    assert_eq!(loss_a.to_bits(), loss_b.to_bits());
    let out = a.blob_id("out").unwrap();
    assert_eq!(data_of(&a, out)?, data_of(&b, b.blob_id("out").unwrap())?);

    let mut c = small_with_inputs(43)?;
    assert_ne!(c.forward()?.to_bits(), loss_a.to_bits());
    Ok(())
}

#[test]
fn test_partial_forward() -> Result<()> {
    let mut net = small_with_inputs(7)?;
    let total = net.forward()?;
    assert_eq!(net.forward_to(3)?, 0.0);
    assert_eq!(net.forward_from_to(4, 4)?, total);
    assert_eq!(net.forward_from(1)?, total);
    Ok(())
}

#[test]
#[should_panic(expected = "out of range")]
fn test_forward_range_checked() {
    let mut net = small_with_inputs(7).unwrap();
    let _ = net.forward_from_to(2, 9);
}

#[test]
fn test_partial_backward_matches_full() -> Result<()> {
    let mut full = small_with_inputs(8)?;
    let mut parts = small_with_inputs(8)?;
    full.forward_backward()?;

    parts.forward()?;
    let auto = parts.top_ids(4)[0];
    parts.tensor(auto).mutable_diff()?[0] = 1.0;
    parts.backward_from_to(4, 3)?;
    parts.backward_from(2)?;
    for (&a, &b) in full.learnable_params().iter().zip(parts.learnable_params()) {
        assert_vec_approx(&diff_of(&parts, b)?, &diff_of(&full, a)?, 1e-12);
    }
    Ok(())
}

#[test]
fn test_in_place_matches_separate_top() -> Result<()> {
    let separate = NetConfig::new("small")
        .with_layer(input(&[("data", &[4, 6]), ("target", &[4, 2])]))
        .with_layer(inner_product("ip", "data", "hidden", 5))
        .with_layer(
            LayerConfig::new("relu", LayerKind::ReLU(ReluParams::default()))
                .with_bottom("hidden")
                .with_top("activated"),
        )
        .with_layer(inner_product("ip2", "activated", "out", 2))
        .with_layer(euclidean("loss", "out", "target"));
    let mut a = small_with_inputs(9)?;
    let mut b = Net::<f64>::new(&separate, Phase::Train, &mut Context::new(9))?;
    fill_gaussian(&b, "data", 100)?;
    fill_gaussian(&b, "target", 101)?;

    let loss_a = a.forward_backward()?;
    let loss_b = b.forward_backward()?;
    assert!(approx_eq(loss_a, loss_b, 1e-12));
    for (&pa, &pb) in a.learnable_params().iter().zip(b.learnable_params()) {
        assert_vec_approx(&diff_of(&a, pa)?, &diff_of(&b, pb)?, 1e-12);
    }
    Ok(())
}

#[test]
fn test_loss_weight_scales_loss_and_gradients() -> Result<()> {
    let mut weighted_config = small_net();
    weighted_config.layers[4] = euclidean("loss", "out", "target").with_loss_weight(2.0);
    let mut plain = small_with_inputs(11)?;
    let mut weighted = Net::<f64>::new(&weighted_config, Phase::Train, &mut Context::new(11))?;
    fill_gaussian(&weighted, "data", 100)?;
    fill_gaussian(&weighted, "target", 101)?;

    let loss = plain.forward_backward()?;
    let doubled = weighted.forward_backward()?;
    assert!(approx_eq(doubled, 2.0 * loss, 1e-12));
    for (&a, &b) in plain.learnable_params().iter().zip(weighted.learnable_params()) {
        let expected: Vec<f64> = diff_of(&plain, a)?.iter().map(|g| 2.0 * g).collect();
        assert_vec_approx(&diff_of(&weighted, b)?, &expected, 1e-12);
    }
    Ok(())
}

#[test]
fn test_param_diffs_accumulate_until_cleared() -> Result<()> {
    let mut net = small_with_inputs(12)?;
    let id = net.learnable_params()[0];
    net.forward_backward()?;
    let once = diff_of(&net, id)?;
    net.forward_backward()?;
    let expected: Vec<f64> = once.iter().map(|g| 2.0 * g).collect();
    assert_vec_approx(&diff_of(&net, id)?, &expected, 1e-12);
    net.clear_param_diffs()?;
    assert!(diff_of(&net, id)?.iter().all(|&g| g == 0.0));
    Ok(())
}

#[test]
fn test_reshape_follows_input() -> Result<()> {
    let mut net = small_with_inputs(13)?;
    net.forward()?;
    net.blob_by_name("data").unwrap().reshape((7, 6));
    net.blob_by_name("target").unwrap().reshape((7, 2));
    net.reshape()?;
    assert_eq!(net.blob_by_name("hidden").unwrap().dims(), &[7, 5]);
    assert_eq!(net.blob_by_name("out").unwrap().dims(), &[7, 2]);
    fill_gaussian(&net, "data", 1)?;
    fill_gaussian(&net, "target", 2)?;
    let loss = net.forward_backward()?;
    assert!(loss.is_finite());
    Ok(())
}

#[test]
fn test_debug_info_runs() -> Result<()> {
    init_logging();
    let mut net = small_with_inputs(14)?;
    net.set_debug_info(true);
    net.forward_backward()?;
    net.update()?;
    Ok(())
}

// Dropout tests

fn dropout_net(size: usize, ratio: f64) -> NetConfig {
    NetConfig::new("dropout")
        .with_layer(input(&[("data", &[size])]))
        .with_layer(
            LayerConfig::new("drop", LayerKind::Dropout(DropoutParams { ratio }))
                .with_bottom("data")
                .with_top("dropped"),
        )
}

#[test]
fn test_dropout_train_rate_and_scale() -> Result<()> {
    let (size, ratio) = (10_000, 0.3);
    let mut net = Net::<f64>::new(&dropout_net(size, ratio), Phase::Train, &mut Context::new(21))?;
    net.blob_by_name("data").unwrap().mutable_data()?.iter_mut().for_each(|v| *v = 1.0);
    net.forward()?;
    let out = data_of(&net, net.blob_id("dropped").unwrap())?;
    let dropped = out.iter().filter(|&&v| v == 0.0).count();
    let scale = 1.0 / (1.0 - ratio);
    assert!(out.iter().all(|&v| v == 0.0 || approx_eq(v, scale, 1e-12)));

    let rate = dropped as f64 / size as f64;
    let std_error = (ratio * (1.0 - ratio) / size as f64).sqrt();
    assert!((rate - ratio).abs() < 4.0 * std_error, "drop rate {rate}");
    Ok(())
}

#[test]
fn test_dropout_test_phase_is_identity() -> Result<()> {
    let mut net = Net::<f64>::new(&dropout_net(100, 0.5), Phase::Test, &mut Context::new(22))?;
    fill_gaussian(&net, "data", 3)?;
    net.forward()?;
    let data = data_of(&net, net.blob_id("data").unwrap())?;
    assert_eq!(data_of(&net, net.blob_id("dropped").unwrap())?, data);
    Ok(())
}

// Records

#[test]
fn test_copy_trained_layers() -> Result<()> {
    let source = small_with_inputs(31)?;
    let mut target = small_with_inputs(32)?;
    let mut record = source.to_record(false)?;
    assert_eq!(record.layers.len(), 5);
    assert!(record.layers.iter().all(|l| l.params.iter().all(|p| p.diff.is_empty())));

    record.layers.push(kiln::LayerRecord {
        name: "not_in_target".into(),
        type_name: "InnerProduct".into(),
        params: vec![],
    });
    target.copy_trained_layers_from(&record)?;
    for (&a, &b) in source.params().iter().zip(target.params()) {
        assert_eq!(data_of(&source, a)?, data_of(&target, b)?);
    }

    let mut wrong_count = record.clone();
    wrong_count.layers[1].params.pop();
    assert!(matches!(target.copy_trained_layers_from(&wrong_count), Err(Error::Config(_))));

    let mut wrong_shape = record;
    wrong_shape.layers[1].params[0] = kiln::TensorRecord {
        shape: kiln::ShapeRecord::Dims(vec![6, 5]),
        data: vec![0.0; 30],
        diff: vec![],
    };
    assert!(matches!(
        target.copy_trained_layers_from(&wrong_shape),
        Err(Error::ShapeMismatch { .. })
    ));

    // A bad later layer leaves earlier layers untouched.
    let mut other = small_with_inputs(33)?.to_record(false)?;
    other.layers[3].params[0] = kiln::TensorRecord {
        shape: kiln::ShapeRecord::Dims(vec![7, 7, 7]),
        data: vec![0.0; 343],
        diff: vec![],
    };
    assert!(target.copy_trained_layers_from(&other).is_err());
    for (&a, &b) in source.params().iter().zip(target.params()) {
        assert_eq!(data_of(&source, a)?, data_of(&target, b)?);
    }
    Ok(())
}

// Accelerator tests

#[test]
fn test_simulated_device_matches_host() -> Result<()> {
    let device = Arc::new(SimulatedDevice::new(0));
    let mut ctx = Context::new(41).with_accelerator(device.clone());
    let mut on_device = Net::<f64>::new(&small_net(), Phase::Train, &mut ctx)?;
    fill_gaussian(&on_device, "data", 100)?;
    fill_gaussian(&on_device, "target", 101)?;
    let mut on_host = small_with_inputs(41)?;

    let device_loss = on_device.forward_backward()?;
    let host_loss = on_host.forward_backward()?;
    assert_eq!(device_loss.to_bits(), host_loss.to_bits());

    // Round trip one parameter through the device.
    let id = on_device.learnable_params()[0];
    let expected = data_of(&on_device, id)?;
    {
        let mut t = on_device.tensor(id);
        t.device_data()?;
        assert_eq!(t.data_state(), SyncState::Synced);
        t.mutable_device_data()?;
        assert_eq!(t.data_state(), SyncState::DeviceFresh);
    }
    assert_eq!(data_of(&on_device, id)?, expected);
    let stats = device.stats();
    assert!(stats.uploads >= 1);
    assert!(stats.downloads >= 1);
    assert!(stats.allocations >= 1);
    Ok(())
}
