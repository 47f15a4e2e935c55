use std::path::{Path, PathBuf};

use argh::FromArgs;
use kornia_image::{allocator::CpuAllocator, Image};
use rand::Rng;
use vla_openvla::{build_prompt, OpenVla, OpenVlaConfig, OpenVlaProcessor, VlaError};

const IMAGE_SIZE: usize = 224;
const INSTRUCTION: &str = "pick up the red block";
const MAX_COT_TOKENS: usize = 50;

#[derive(FromArgs)]
/// Quick smoke test for chain-of-thought action prediction, without running
/// a full evaluation. Example: cot_smoke /path/to/openvla-7b
struct Args {
    /// path to a pretrained model directory
    #[argh(positional)]
    model_path: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let Some(model_path) = args.model_path else {
        println!("Usage: cot_smoke <path_to_model>");
        println!("Example: cot_smoke /path/to/openvla-7b");
        std::process::exit(1);
    };

    if !model_path.exists() {
        println!("Error: Model path does not exist: {}", model_path.display());
        std::process::exit(1);
    }

    let success = test_cot_functionality(&model_path);
    std::process::exit(if success { 0 } else { 1 });
}

/// Run the four smoke-test stages, reporting each one to stdout. Any stage
/// failure aborts the remaining stages.
fn test_cot_functionality(model_path: &Path) -> bool {
    println!("{}", "=".repeat(80));
    println!("Testing CoT action prediction");
    println!("{}", "=".repeat(80));

    println!("\n1. Loading model...");
    let (mut model, mut processor) = match load_model_and_processor(model_path) {
        Ok(handles) => {
            println!("   ✓ Model loaded successfully");
            handles
        }
        Err(e) => {
            println!("   ✗ Error loading model: {e}");
            return false;
        }
    };

    println!("\n2. Creating test input...");
    let (image, prompt_no_cot, prompt_with_cot) = match build_test_input() {
        Ok((image, no_cot, with_cot)) => {
            println!("   Prompt (no CoT): {no_cot}");
            println!("   Prompt (CoT):    {with_cot}");
            println!("   ✓ Test input created");
            (image, no_cot, with_cot)
        }
        Err(e) => {
            println!("   ✗ Error creating input: {e}");
            return false;
        }
    };

    println!("\n3. Testing without CoT...");
    match run_without_cot(&mut model, &mut processor, &prompt_no_cot, &image) {
        Ok(()) => println!("   ✓ No-CoT inference successful"),
        Err(e) => {
            println!("   ✗ Error in no-CoT inference: {e}");
            return false;
        }
    }

    println!("\n4. Testing with CoT...");
    if let Err(e) = run_with_cot(&mut model, &mut processor, &prompt_with_cot, &image) {
        println!("   ✗ Error in CoT inference: {e}");
        println!("{e:?}");
        return false;
    }

    println!("\n{}", "=".repeat(80));
    println!("✓ All tests passed!");
    println!("{}", "=".repeat(80));
    true
}

fn load_model_and_processor(model_path: &Path) -> Result<(OpenVla, OpenVlaProcessor), VlaError> {
    let model = OpenVla::from_pretrained(model_path, OpenVlaConfig::default())?;
    let processor = model.processor(model_path)?;
    Ok((model, processor))
}

/// One synthetic rgb8 image of uniformly random bytes plus the two prompt
/// variants for the fixed instruction.
fn build_test_input() -> Result<(Image<u8, 3, CpuAllocator>, String, String), VlaError> {
    let mut rng = rand::rng();
    let data: Vec<u8> = (0..IMAGE_SIZE * IMAGE_SIZE * 3)
        .map(|_| rng.random())
        .collect();
    let image = Image::new([IMAGE_SIZE, IMAGE_SIZE].into(), data, CpuAllocator)?;

    let prompt_no_cot = build_prompt(INSTRUCTION, false);
    let prompt_with_cot = build_prompt(INSTRUCTION, true);

    Ok((image, prompt_no_cot, prompt_with_cot))
}

fn run_without_cot(
    model: &mut OpenVla,
    processor: &mut OpenVlaProcessor,
    prompt: &str,
    image: &Image<u8, 3, CpuAllocator>,
) -> Result<(), VlaError> {
    let inputs = processor.process(prompt, image)?;
    let (actions, hidden_states) = model.predict_action(&inputs)?;

    println!("   Actions shape: {:?}", actions.shape());
    match &hidden_states {
        Some(h) => println!("   Hidden states shape: {:?}", h.shape()),
        None => println!("   Hidden states shape: None"),
    }

    Ok(())
}

fn run_with_cot(
    model: &mut OpenVla,
    processor: &mut OpenVlaProcessor,
    prompt: &str,
    image: &Image<u8, 3, CpuAllocator>,
) -> Result<(), VlaError> {
    let inputs = processor.process(prompt, image)?;
    let (actions, hidden_states, cot_token_ids) =
        model.predict_action_with_cot(&inputs, MAX_COT_TOKENS)?;

    println!("   Actions shape: {:?}", actions.shape());
    match &hidden_states {
        Some(h) => println!("   Hidden states shape: {:?}", h.shape()),
        None => println!("   Hidden states shape: None"),
    }

    match cot_token_ids {
        Some(ids) => {
            let cot_text = processor.decode(&ids, true)?;
            let preview: String = cot_text.chars().take(100).collect();
            println!("   CoT tokens: {}", ids.len());
            println!("   CoT text preview: {preview}...");
            println!("   ✓ CoT inference successful");
        }
        None => println!("   ⚠ No CoT tokens generated"),
    }

    Ok(())
}
