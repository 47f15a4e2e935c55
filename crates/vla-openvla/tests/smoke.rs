use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Shape, Tensor};
use kornia_image::{allocator::CpuAllocator, Image};
use rand::Rng;
use vla_openvla::{build_prompt, OpenVla, OpenVlaConfig, VlaError};

const CONFIG_JSON: &str = r#"{
    "text_config": {
        "hidden_size": 32,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "intermediate_size": 64,
        "vocab_size": 96,
        "max_position_embeddings": 512,
        "eos_token_id": 2
    },
    "vision_config": {
        "image_size": 28,
        "patch_size": 14,
        "hidden_size": 16,
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "intermediate_size": 32
    },
    "action_dim": 3,
    "num_action_bins": 16
}"#;

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [
        { "id": 0, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true },
        { "id": 1, "content": "<s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true },
        { "id": 2, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true }
    ],
    "normalizer": { "type": "Lowercase" },
    "pre_tokenizer": { "type": "Whitespace" },
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "<unk>": 0, "<s>": 1, "</s>": 2,
            "in": 3, "out": 4, ":": 5, "?": 6,
            "what": 7, "action": 8, "should": 9, "the": 10,
            "robot": 11, "take": 12, "to": 13, "pick": 14,
            "up": 15, "fork": 16, "red": 17, "block": 18
        },
        "unk_token": "<unk>"
    }
}"#;

fn rand_t(shape: impl Into<Shape>) -> Tensor {
    Tensor::randn(0f32, 0.02f32, shape, &Device::Cpu).unwrap()
}

fn checkpoint_tensors() -> HashMap<String, Tensor> {
    let mut t = HashMap::new();

    t.insert("language_model.embed_tokens.weight".to_string(), rand_t((96, 32)));
    t.insert("language_model.norm.weight".to_string(), rand_t(32));
    t.insert("lm_head.weight".to_string(), rand_t((96, 32)));

    for i in 0..2 {
        let p = format!("language_model.layers.{i}");
        t.insert(format!("{p}.input_layernorm.weight"), rand_t(32));
        t.insert(format!("{p}.self_attn.q_proj.weight"), rand_t((32, 32)));
        t.insert(format!("{p}.self_attn.k_proj.weight"), rand_t((32, 32)));
        t.insert(format!("{p}.self_attn.v_proj.weight"), rand_t((32, 32)));
        t.insert(format!("{p}.self_attn.o_proj.weight"), rand_t((32, 32)));
        t.insert(format!("{p}.post_attention_layernorm.weight"), rand_t(32));
        t.insert(format!("{p}.mlp.gate_proj.weight"), rand_t((64, 32)));
        t.insert(format!("{p}.mlp.up_proj.weight"), rand_t((64, 32)));
        t.insert(format!("{p}.mlp.down_proj.weight"), rand_t((32, 64)));
    }

    t.insert("vision_model.patch_embedding.weight".to_string(), rand_t((16, 3, 14, 14)));
    t.insert("vision_model.patch_embedding.bias".to_string(), rand_t(16));
    t.insert("vision_model.position_embedding.weight".to_string(), rand_t((4, 16)));

    let p = "vision_model.layers.0";
    t.insert(format!("{p}.layer_norm1.weight"), rand_t(16));
    t.insert(format!("{p}.layer_norm1.bias"), rand_t(16));
    t.insert(format!("{p}.self_attn.q_proj.weight"), rand_t((16, 16)));
    t.insert(format!("{p}.self_attn.q_proj.bias"), rand_t(16));
    t.insert(format!("{p}.self_attn.k_proj.weight"), rand_t((16, 16)));
    t.insert(format!("{p}.self_attn.k_proj.bias"), rand_t(16));
    t.insert(format!("{p}.self_attn.v_proj.weight"), rand_t((16, 16)));
    t.insert(format!("{p}.self_attn.v_proj.bias"), rand_t(16));
    t.insert(format!("{p}.self_attn.out_proj.weight"), rand_t((16, 16)));
    t.insert(format!("{p}.self_attn.out_proj.bias"), rand_t(16));
    t.insert(format!("{p}.layer_norm2.weight"), rand_t(16));
    t.insert(format!("{p}.layer_norm2.bias"), rand_t(16));
    t.insert(format!("{p}.mlp.fc1.weight"), rand_t((32, 16)));
    t.insert(format!("{p}.mlp.fc1.bias"), rand_t(32));
    t.insert(format!("{p}.mlp.fc2.weight"), rand_t((16, 32)));
    t.insert(format!("{p}.mlp.fc2.bias"), rand_t(16));

    t.insert("vision_model.post_layernorm.weight".to_string(), rand_t(16));
    t.insert("vision_model.post_layernorm.bias".to_string(), rand_t(16));

    t.insert("projector.weight".to_string(), rand_t((32, 16)));
    t.insert("projector.bias".to_string(), rand_t(32));

    t
}

fn write_checkpoint(dir: &Path) {
    fs::write(dir.join("config.json"), CONFIG_JSON).unwrap();
    fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
    candle_core::safetensors::save(&checkpoint_tensors(), dir.join("model.safetensors")).unwrap();
}

fn test_image(size: usize) -> Image<u8, 3, CpuAllocator> {
    let mut rng = rand::rng();
    let data: Vec<u8> = (0..size * size * 3).map(|_| rng.random()).collect();
    Image::new([size, size].into(), data, CpuAllocator).unwrap()
}

#[test]
fn missing_path_fails_without_loading() {
    let err = OpenVla::from_pretrained("/nonexistent/path", OpenVlaConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, VlaError::ModelPathNotFound(_)));
}

#[test]
fn truncated_checkpoint_reports_the_missing_tensor() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("config.json"), CONFIG_JSON).unwrap();
    fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON).unwrap();

    let mut tensors = checkpoint_tensors();
    tensors.remove("projector.bias");
    candle_core::safetensors::save(&tensors, dir.path().join("model.safetensors")).unwrap();

    let err = OpenVla::from_pretrained(dir.path(), OpenVlaConfig::default())
        .err()
        .unwrap();
    match err {
        VlaError::MissingTensor(name) => assert_eq!(name, "projector.bias"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn fabricated_checkpoint_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path());

    let mut model = OpenVla::from_pretrained(dir.path(), OpenVlaConfig::default()).unwrap();
    let mut processor = model.processor(dir.path()).unwrap();

    let image = test_image(28);

    // processor output shapes
    let inputs = processor
        .process(&build_prompt("pick up the fork", false), &image)
        .unwrap();
    assert_eq!(inputs.pixel_values.dims(), &[1, 3, 28, 28]);
    assert_eq!(inputs.input_ids.dims().len(), 1);
    assert!(inputs.input_ids.dims()[0] > 0);

    // no-CoT prediction: action tensor plus hidden states
    let (actions, hidden) = model.predict_action(&inputs).unwrap();
    assert_eq!(actions.dims(), &[3]);
    for v in actions.to_vec1::<f32>().unwrap() {
        assert!((-1.0..=1.0).contains(&v));
    }
    let hidden = hidden.unwrap();
    assert_eq!(hidden.dims().len(), 2);
    assert_eq!(hidden.dims()[1], 32);

    // CoT prediction on the same loaded model
    let inputs = processor
        .process(&build_prompt("pick up the fork", true), &image)
        .unwrap();
    let (actions, hidden, cot) = model.predict_action_with_cot(&inputs, 8).unwrap();
    assert_eq!(actions.dims(), &[3]);
    assert!(hidden.is_some());
    if let Some(ids) = cot {
        assert!(!ids.is_empty());
        assert!(ids.len() <= 8);
        // decoding the generated ids must not fail
        processor.decode(&ids, true).unwrap();
    }
}

#[test]
fn zero_token_budget_yields_no_cot() {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path());

    let mut model = OpenVla::from_pretrained(dir.path(), OpenVlaConfig::default()).unwrap();
    let mut processor = model.processor(dir.path()).unwrap();

    let inputs = processor
        .process(&build_prompt("pick up the red block", true), &test_image(28))
        .unwrap();
    let (actions, _hidden, cot) = model.predict_action_with_cot(&inputs, 0).unwrap();
    assert_eq!(actions.dims(), &[3]);
    assert!(cot.is_none());
}

#[test]
fn tokenizer_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path());

    let model = OpenVla::from_pretrained(dir.path(), OpenVlaConfig::default()).unwrap();
    let processor = model.processor(dir.path()).unwrap();

    assert_eq!(processor.decode(&[14, 15], true).unwrap(), "pick up");
    // ids outside the vocabulary decode to nothing rather than failing
    processor.decode(&[90], true).unwrap();
}

// Runs only against a real checkpoint, pointed at by OPENVLA_MODEL_DIR.
#[test]
fn full_checkpoint_smoke() {
    let model_path = match std::env::var("OPENVLA_MODEL_DIR") {
        Ok(p) => PathBuf::from(p),
        Err(_) => {
            println!("Skipping test: OPENVLA_MODEL_DIR not set");
            return;
        }
    };
    if !model_path.exists() {
        println!("Skipping test: model not found at {model_path:?}");
        return;
    }

    let mut model = OpenVla::from_pretrained(&model_path, OpenVlaConfig::default()).unwrap();
    let mut processor = model.processor(&model_path).unwrap();

    let image = test_image(224);
    let inputs = processor
        .process(&build_prompt("pick up the red block", false), &image)
        .unwrap();

    let (actions, _hidden) = model.predict_action(&inputs).unwrap();
    assert_eq!(actions.dims(), &[model.arch().action_dim]);

    let inputs = processor
        .process(&build_prompt("pick up the red block", true), &image)
        .unwrap();
    let (actions, _hidden, _cot) = model.predict_action_with_cot(&inputs, 50).unwrap();
    assert_eq!(actions.dims(), &[model.arch().action_dim]);
}
